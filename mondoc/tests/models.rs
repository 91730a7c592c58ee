mod common;

use common::{Author, Person, Post, database};
use mondoc::{error::ErrorKind, prelude::*};

#[tokio::test]
async fn saving_a_clean_record_issues_no_write() {
    let (db, store) = database();

    let mut ada = Person::create(&db, Person::new("Ada", 36))
        .await
        .unwrap();
    assert!(ada.is_persisted());
    assert_eq!(store.writes(), 1);

    assert_eq!(ada.save(&db).await.unwrap(), SaveOutcome::Unchanged);
    assert_eq!(store.writes(), 1);

    ada.age = 37;
    assert_eq!(ada.dirty_fields().unwrap(), vec!["age".to_string()]);
    assert_eq!(ada.save(&db).await.unwrap(), SaveOutcome::Updated);
    assert_eq!(ada.original(), &ada.attributes().unwrap());

    ada.age = 37;
    assert!(!ada.is_dirty().unwrap());
    assert_eq!(ada.save(&db).await.unwrap(), SaveOutcome::Unchanged);
    assert_eq!(store.writes(), 2);

    let stored = Person::find_or_fail(&db, ada.id.unwrap())
        .await
        .unwrap();
    assert_eq!(stored.age, 37);
}

#[tokio::test]
async fn rules_reject_invalid_values() {
    let (db, store) = database();

    let error = Person::create(&db, Person::new("Kid", 17))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    match error {
        OdmError::Validation { field, value, rules } => {
            assert_eq!(field, "age");
            assert_eq!(value, Bson::Int32(17));
            assert_eq!(rules.len(), 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn aborting_hook_skips_the_write() {
    let (db, store) = database();

    let blocked = Person::create(&db, Person::new("blocked", 40))
        .await
        .unwrap();
    assert!(!blocked.is_persisted());
    assert_eq!(store.writes(), 0);

    let mut record = Record::new(Person::new("blocked", 40));
    assert_eq!(record.save(&db).await.unwrap(), SaveOutcome::Aborted);
    assert_eq!(Person::query().count(&db).await.unwrap(), 0);
}

#[tokio::test]
async fn paginates_with_navigation_metadata() {
    let (db, _) = database();
    let people = (0..25)
        .map(|i| Person::new(&format!("person-{i:02}"), 20 + i))
        .collect();
    Person::create_many(&db, people).await.unwrap();

    let page = Person::query()
        .order_by("name", "asc")
        .paginate(&db, 2, 5)
        .await
        .unwrap();

    assert_eq!(page.data.len(), 5);
    assert_eq!(page.data[0].name, "person-05");
    assert_eq!(page.meta.total, 25);
    assert_eq!(page.meta.last_page, 5);
    assert_eq!(page.meta.from, Some(6));
    assert_eq!(page.meta.to, Some(10));
    assert!(page.meta.has_next);
    assert!(page.meta.has_prev);

    let beyond = Person::query()
        .paginate(&db, 9, 5)
        .await
        .unwrap();
    assert!(beyond.data.is_empty());
    assert_eq!(beyond.meta.from, None);

    let error = Person::query()
        .paginate(&db, 0, 5)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Operation);
}

#[tokio::test]
async fn pages_past_the_addressable_range_are_rejected() {
    let (db, store) = database();
    Person::create(&db, Person::new("Ada", 36)).await.unwrap();

    let before = store.finds();
    let error = Person::query()
        .paginate(&db, u64::MAX, 2)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Operation);
    assert_eq!(store.finds(), before);

    let error = Person::query()
        .for_page(usize::MAX, 2)
        .fetch(&db)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Operation);

    let everything = Person::query()
        .paginate(&db, 1, u64::MAX)
        .await
        .unwrap();
    assert_eq!(everything.data.len(), 1);
    assert_eq!(everything.meta.last_page, 1);
}

#[derive(Debug, Clone, Serialize, Deserialize, Model)]
struct Member {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    status: String,
    role: String,
}

#[tokio::test]
async fn or_conditions_widen_a_paginated_query() {
    let (db, _) = database();
    let member = |status: &str, role: &str| Member {
        id: None,
        status: status.into(),
        role: role.into(),
    };
    let members = std::iter::repeat_with(|| member("active", "user"))
        .take(25)
        .chain(std::iter::repeat_with(|| member("suspended", "admin")).take(5))
        .chain(std::iter::repeat_with(|| member("suspended", "user")).take(4))
        .collect();
    Member::create_many(&db, members).await.unwrap();
    assert_eq!(Member::schema().collection(), "members");

    let page = Member::query()
        .where_eq("status", "active")
        .or_where_eq("role", "admin")
        .paginate(&db, 1, 10)
        .await
        .unwrap();

    assert_eq!(page.meta.total, 30);
    assert_eq!(page.data.len(), 10);
    assert!(page.meta.has_next);
    assert!(!page.meta.has_prev);
}

#[tokio::test]
async fn both_operator_alphabets_select_the_same_records() {
    let (db, _) = database();
    Person::create_many(
        &db,
        vec![Person::new("Ada", 36), Person::new("Grace", 45), Person::new("Linus", 28)],
    )
    .await
    .unwrap();

    let symbolic = Person::query()
        .where_op("age", ">=", 30)
        .where_op("name", "like", "%a%")
        .order_by_asc("age")
        .fetch(&db)
        .await
        .unwrap();
    let named = Person::query()
        .where_op("age", "gte", 30)
        .where_op("name", "like", "%a%")
        .order_by_asc("age")
        .fetch(&db)
        .await
        .unwrap();

    let names = |records: &[Record<Person>]| records.iter().map(|r| r.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&symbolic), vec!["Ada", "Grace"]);
    assert_eq!(names(&symbolic), names(&named));
}

#[tokio::test]
async fn query_updates_and_deletes_report_counts() {
    let (db, _) = database();
    Person::create_many(
        &db,
        vec![Person::new("Ada", 36), Person::new("Grace", 45), Person::new("Linus", 28)],
    )
    .await
    .unwrap();

    let matched = Person::query()
        .where_op("age", ">", 30)
        .update(&db, doc! { "age": 50 })
        .await
        .unwrap();
    assert_eq!(matched, 2);
    assert_eq!(
        Person::query()
            .where_eq("age", 50)
            .count(&db)
            .await
            .unwrap(),
        2
    );

    let removed = Person::query()
        .where_eq("name", "Linus")
        .delete(&db)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(Person::find_by(&db, "name", "Linus").await.unwrap().is_none());
}

#[derive(Debug, Clone, Serialize, Deserialize, Model)]
struct Ticket {
    #[mondoc(primary)]
    code: String,
    title: String,
}

#[tokio::test]
async fn bulk_updates_cannot_touch_the_primary_key() {
    let (db, _) = database();
    Ticket::create(&db, Ticket { code: "T-1".into(), title: "Broken login".into() })
        .await
        .unwrap();
    assert_eq!(Ticket::schema().primary_key(), "code");
    assert_eq!(Ticket::schema().primary_column(), "_id");

    for values in [doc! { "code": "T-2" }, doc! { "_id": "T-2" }, doc! { "title": "x", "_id": "T-2" }] {
        let error = Ticket::query()
            .update(&db, values)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Operation);
    }

    let ticket = Ticket::find_or_fail(&db, "T-1").await.unwrap();
    assert_eq!(ticket.title, "Broken login");
}

#[tokio::test]
async fn exists_reads_a_single_key() {
    let (db, store) = database();
    Person::create_many(
        &db,
        vec![Person::new("Ada", 36), Person::new("Grace", 45), Person::new("Linus", 28)],
    )
    .await
    .unwrap();

    let before = store.finds();
    assert!(Person::query().where_op("age", ">", 30).exists(&db).await.unwrap());
    assert!(!Person::query().where_op("age", ">", 90).exists(&db).await.unwrap());
    assert!(Person::query().where_op("age", ">", 20).skip(10).exists(&db).await.unwrap());
    assert_eq!(store.finds() - before, 3);
}

#[tokio::test]
async fn failed_inserts_leave_the_record_untouched() {
    let (db, store) = database();
    let mut record = Record::new(Person::new("Ada", 36));

    store.fail_inserts();
    let error = record.save(&db).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Operation);
    assert!(record.id.is_none());
    assert!(!record.is_persisted());

    store.allow_inserts();
    assert_eq!(record.save(&db).await.unwrap(), SaveOutcome::Created);
    assert!(record.id.is_some());
    assert!(record.is_persisted());
    assert_eq!(Person::query().count(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn hidden_fields_stay_out_of_serialized_output() {
    let (db, _) = database();
    let mut person = Person::new("Ada", 36);
    person.password = "secret".into();
    let ada = Person::create(&db, person).await.unwrap();

    let json = ada.to_json().unwrap();
    assert_eq!(json["name"], "Ada");
    assert!(json.get("password").is_none());
}

#[tokio::test]
async fn relations_load_with_one_batched_query() {
    let (db, store) = database();
    let authors = Author::create_many(
        &db,
        vec![
            Author { id: None, name: "Ada".into() },
            Author { id: None, name: "Grace".into() },
            Author { id: None, name: "Linus".into() },
        ],
    )
    .await
    .unwrap();

    for (author, titles) in authors.iter().zip([&["Notes", "Engines"][..], &["Compilers"][..], &[][..]]) {
        for title in titles {
            Post::create(
                &db,
                Post {
                    id: None,
                    author_id: author.id.unwrap(),
                    title: title.to_string(),
                },
            )
            .await
            .unwrap();
        }
    }

    let before = store.finds();
    let loaded = Author::query()
        .order_by_asc("name")
        .load("posts")
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(store.finds() - before, 2);

    let counts = loaded
        .iter()
        .map(|author| author.related_many::<Post>("posts").len())
        .collect::<Vec<_>>();
    assert_eq!(counts, vec![2, 1, 0]);

    let post = Post::query()
        .where_eq("title", "Compilers")
        .load("author")
        .first_or_fail(&db)
        .await
        .unwrap();
    let author = post.related_one::<Author>("author").unwrap();
    assert_eq!(author.name, "Grace");

    let error = Author::query()
        .load("comments")
        .fetch(&db)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Operation);
}

#[tokio::test]
async fn connects_from_configuration() {
    let config = OdmConfig::new("main")
        .with_connection("main", ConnectionConfig::memory("app"))
        .with_connection("audit", ConnectionConfig::memory("audit"));

    let db = mondoc::connect(&config).await.unwrap();
    assert_eq!(db.connection_names(), vec!["audit", "main"]);
    assert_eq!(db.default_connection().unwrap().name(), "main");

    let ada = Person::create(&db, Person::new("Ada", 36))
        .await
        .unwrap();
    assert!(ada.is_persisted());

    let missing_default = OdmConfig::new("primary").with_connection("main", ConnectionConfig::memory("app"));
    let error = mondoc::connect(&missing_default).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Connection);
}

#[cfg(not(feature = "mongodb"))]
#[tokio::test]
async fn mongodb_connections_need_the_feature() {
    let config = OdmConfig::new("main").with_connection(
        "main",
        ConnectionConfig::mongodb("mongodb://localhost:27017", "app"),
    );

    let error = mondoc::connect(&config).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Connection);
}
