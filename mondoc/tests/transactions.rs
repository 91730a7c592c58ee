mod common;

use std::error::Error as _;

use common::{Person, database};
use mondoc::{error::ErrorKind, prelude::*};

#[tokio::test]
async fn managed_transaction_commits_on_success() {
    let (db, _) = database();

    let id = db
        .transaction(|trx| async move {
            let ada = Person::create(&trx, Person::new("Ada", 36)).await?;
            Person::create(&trx, Person::new("Grace", 45)).await?;

            // Reads inside the transaction see its own writes.
            assert_eq!(Person::query().count(&trx).await?, 2);
            Ok::<_, OdmError>(ada.id)
        })
        .await
        .unwrap();

    assert!(id.is_some());
    assert_eq!(Person::query().count(&db).await.unwrap(), 2);
}

#[tokio::test]
async fn managed_transaction_rolls_back_every_write() {
    let (db, _) = database();
    Person::create(&db, Person::new("Linus", 28))
        .await
        .unwrap();

    let error = db
        .transaction(|trx| async move {
            Person::create(&trx, Person::new("Ada", 36)).await?;
            Person::query()
                .where_eq("name", "Linus")
                .update(&trx, doc! { "age": 60 })
                .await?;
            Err::<(), _>(OdmError::operation("checkout", "card declined"))
        })
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Operation);
    assert_eq!(error.to_string(), "Operation `checkout` failed: card declined");

    let people = Person::all(&db).await.unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0].age, 28);
}

#[tokio::test]
async fn writes_outside_the_transaction_are_not_blocked() {
    let (db, _) = database();
    let trx = db.begin_transaction().await.unwrap();

    Person::create(&trx, Person::new("Ada", 36))
        .await
        .unwrap();
    Person::create(&db, Person::new("Grace", 45))
        .await
        .unwrap();
    assert_eq!(Person::query().count(&db).await.unwrap(), 1);

    trx.commit().await.unwrap();
    assert_eq!(Person::query().count(&db).await.unwrap(), 2);
}

#[tokio::test]
async fn terminal_transactions_fail_fast() {
    let (db, store) = database();
    let trx = db.begin_transaction().await.unwrap();
    trx.commit().await.unwrap();
    assert_eq!(trx.state(), TransactionState::Committed);

    let writes = store.writes();
    let error = Person::create(&trx, Person::new("Ada", 36))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        OdmError::Transaction {
            phase: TransactionPhase::Use,
            ..
        }
    ));
    assert_eq!(store.writes(), writes);

    let error = Person::query()
        .use_transaction(trx.clone())
        .fetch(&db)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Transaction);

    let error = trx.rollback().await.unwrap_err();
    assert!(matches!(
        error,
        OdmError::Transaction {
            phase: TransactionPhase::Rollback,
            ..
        }
    ));
}

#[tokio::test]
async fn records_bound_to_a_transaction_write_through_it() {
    let (db, _) = database();
    let mut ada = Person::create(&db, Person::new("Ada", 36))
        .await
        .unwrap();

    let trx = db.begin_transaction().await.unwrap();
    ada.use_transaction(trx.clone());
    ada.age = 37;
    ada.save(&db).await.unwrap();

    assert_eq!(Person::find_by(&db, "name", "Ada").await.unwrap().unwrap().age, 36);
    trx.rollback().await.unwrap();
    assert_eq!(Person::find_by(&db, "name", "Ada").await.unwrap().unwrap().age, 36);
}

#[tokio::test]
async fn failed_rollback_keeps_the_original_error_as_source() {
    let (db, store) = database();
    store.fail_aborts();

    let error = db
        .transaction(|trx| async move {
            Person::create(&trx, Person::new("Ada", 36)).await?;
            Err::<(), _>(OdmError::operation("checkout", "card declined"))
        })
        .await
        .unwrap_err();

    match &error {
        OdmError::Transaction {
            phase: TransactionPhase::Rollback,
            source: Some(source),
            ..
        } => assert_eq!(source.to_string(), "Operation `checkout` failed: card declined"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(error.source().is_some());
}

#[tokio::test]
async fn raw_collections_join_the_transaction() {
    let (db, _) = database();
    let trx = db.begin_transaction().await.unwrap();

    trx.collection("events")
        .insert(vec![doc! { "kind": "signup" }, doc! { "kind": "login" }])
        .await
        .unwrap();
    assert_eq!(trx.collection("events").count(None).await.unwrap(), 2);
    assert_eq!(db.collection("events").unwrap().count(None).await.unwrap(), 0);

    trx.rollback().await.unwrap();
    assert!(!trx.is_active());
    assert_eq!(db.collection("events").unwrap().count(None).await.unwrap(), 0);
}
