mod common;

use common::{Address, Customer, StoredAddress, addresses, database};
use mondoc::{error::ErrorKind, prelude::*};

async fn seed_customer(db: &Database) -> Record<Customer> {
    Customer::create(
        db,
        Customer {
            id: None,
            name: "Nora".into(),
            addresses: addresses(),
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn embedded_queries_match_collection_queries() {
    let (db, _) = database();
    let customer = seed_customer(&db).await;
    for address in addresses() {
        StoredAddress::create(
            &db,
            StoredAddress {
                id: None,
                city: address.city,
                zip: address.zip,
                floor: address.floor,
            },
        )
        .await
        .unwrap();
    }

    let embedded = customer
        .embedded::<Address>("addresses")
        .unwrap()
        .where_op("floor", ">", 1)
        .or_where_eq("city", "Bergen")
        .order_by_desc("floor")
        .get()
        .unwrap()
        .into_iter()
        .map(|a| a.zip)
        .collect::<Vec<_>>();
    let stored = StoredAddress::query()
        .where_op("floor", ">", 1)
        .or_where_eq("city", "Bergen")
        .order_by_desc("floor")
        .fetch(&db)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.into_model().zip)
        .collect::<Vec<_>>();
    assert_eq!(embedded, vec!["0182", "0150", "7010", "5003"]);
    assert_eq!(embedded, stored);

    let embedded = customer
        .embedded::<Address>("addresses")
        .unwrap()
        .where_between("floor", 2, 3)
        .where_not_in("city", ["Oslo"])
        .count()
        .unwrap();
    let stored = StoredAddress::query()
        .where_between("floor", 2, 3)
        .where_not_in("city", ["Oslo"])
        .count(&db)
        .await
        .unwrap();
    assert_eq!(embedded, 1);
    assert_eq!(embedded as u64, stored);
}

#[tokio::test]
async fn embedded_aggregates_and_pages() {
    let (db, _) = database();
    let customer = seed_customer(&db).await;
    let query = customer.embedded::<Address>("addresses").unwrap();

    let stats = query.aggregate("floor").unwrap();
    assert_eq!(stats.count, 4);
    assert_eq!(stats.sum, 13.0);
    assert_eq!(stats.min, Some(Bson::Int32(1)));
    assert_eq!(stats.max, Some(Bson::Int32(7)));

    let cities = query.distinct("city").unwrap();
    assert_eq!(cities.len(), 3);

    let page = query.paginate(2, 3).unwrap();
    assert_eq!(page.data, vec![Address::new("Trondheim", "7010", 2)]);
    assert_eq!(page.meta.last_page, 2);
}

#[tokio::test]
async fn in_memory_and_store_side_element_filters_agree() {
    let (db, store) = database();
    let customer = seed_customer(&db).await;

    let before = store.finds();
    let in_memory = Customer::query()
        .embed_with::<Address, _>("addresses", |q| q.where_eq("city", "Oslo"))
        .find_or_fail(&db, customer.id.unwrap())
        .await
        .unwrap();
    assert_eq!(store.finds() - before, 1);

    let pushed_down = Customer::query()
        .embed_pushdown("addresses", |g| g.where_eq("city", "Oslo"))
        .find_or_fail(&db, customer.id.unwrap())
        .await
        .unwrap();

    assert_eq!(in_memory.addresses.len(), 2);
    assert_eq!(in_memory.addresses, pushed_down.addresses);

    let error = Customer::query()
        .embed("nicknames")
        .fetch(&db)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Operation);
}

#[tokio::test]
async fn element_writes_address_the_stored_element() {
    let (db, _) = database();
    let customer = seed_customer(&db).await;
    let id = customer.id.unwrap();

    let mut oslo = Customer::query()
        .embed_with::<Address, _>("addresses", |q| q.where_eq("city", "Oslo"))
        .find_or_fail(&db, id)
        .await
        .unwrap();

    {
        let mut field = oslo.embedded_mut::<Address>("addresses").unwrap();
        let mut element = field.at(1).unwrap();
        let mut address = element.get().unwrap();
        address.floor = 9;
        element.set(address).unwrap();
        assert!(element.is_dirty().unwrap());
        assert_eq!(element.save(&db).await.unwrap(), SaveOutcome::Updated);

        let error = field.create(Address::new("Oslo", "0151", 1)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Operation);
    }

    let stored = Customer::find_or_fail(&db, id).await.unwrap();
    assert_eq!(stored.addresses[2].floor, 9);
    assert_eq!(stored.addresses[0], addresses()[0]);

    {
        let mut field = oslo.embedded_mut::<Address>("addresses").unwrap();
        let element = field.at(0).unwrap();
        assert_eq!(element.delete(&db).await.unwrap(), DeleteOutcome::Deleted);
    }
    assert_eq!(oslo.addresses.len(), 1);

    let stored = Customer::find_or_fail(&db, id).await.unwrap();
    let zips = stored
        .addresses
        .iter()
        .map(|a| a.zip.as_str())
        .collect::<Vec<_>>();
    assert_eq!(zips, vec!["5003", "0182", "7010"]);
}

#[tokio::test]
async fn new_elements_are_appended_on_save() {
    let (db, _) = database();
    let mut customer = seed_customer(&db).await;

    {
        let mut field = customer.embedded_mut::<Address>("addresses").unwrap();
        let position = field.create(Address::new("Tromsø", "9008", 4)).unwrap();
        assert_eq!(position, 4);
        assert_eq!(field.at(position).unwrap().save(&db).await.unwrap(), SaveOutcome::Updated);
    }

    assert_eq!(customer.save(&db).await.unwrap(), SaveOutcome::Unchanged);

    let stored = Customer::find_or_fail(&db, customer.id.unwrap())
        .await
        .unwrap();
    assert_eq!(stored.addresses.len(), 5);
    assert_eq!(stored.addresses[4].city, "Tromsø");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Round {
    label: String,
    scores: Vec<i32>,
    tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Model)]
struct Player {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    #[mondoc(embedded)]
    #[serde(default)]
    rounds: Vec<Round>,
}

fn round(label: &str, scores: &[i32], tags: &[&str]) -> Round {
    Round {
        label: label.into(),
        scores: scores.to_vec(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
    }
}

fn round_filter<D: FilterDsl>(case: usize, filter: D) -> D {
    match case {
        0 => filter.where_op("scores", ">", 5),
        1 => filter.where_between("scores", 5, 10),
        2 => filter.where_in("scores", [1, 12]),
        3 => filter.where_like("tags", "%ed"),
        4 => filter.where_regex("tags", "^bl"),
        5 => filter
            .where_op("scores", "<=", 1)
            .or_where_like("label", "f%"),
        _ => filter.where_not_in("scores", [4]),
    }
}

#[tokio::test]
async fn element_filters_agree_on_array_valued_fields() {
    let (db, _) = database();
    let player = Player::create(
        &db,
        Player {
            id: None,
            rounds: vec![
                round("first", &[1, 9], &["red", "blue"]),
                round("second", &[4], &["green"]),
                round("third", &[], &[]),
                round("fourth", &[12], &["Red"]),
            ],
        },
    )
    .await
    .unwrap();
    let id = player.id.unwrap();

    let expected: [&[&str]; 7] = [
        &["first", "fourth"],
        &["first"],
        &["first", "fourth"],
        &["first", "fourth"],
        &["first"],
        &["first", "fourth"],
        &["first", "third", "fourth"],
    ];

    for (case, expected) in expected.into_iter().enumerate() {
        let in_memory = Player::query()
            .embed_with::<Round, _>("rounds", move |q| round_filter(case, q))
            .find_or_fail(&db, id)
            .await
            .unwrap();
        let pushed_down = Player::query()
            .embed_pushdown("rounds", |g| round_filter(case, g))
            .find_or_fail(&db, id)
            .await
            .unwrap();

        let labels = in_memory
            .rounds
            .iter()
            .map(|r| r.label.as_str())
            .collect::<Vec<_>>();
        assert_eq!(labels, expected, "case {case}");
        assert_eq!(in_memory.rounds, pushed_down.rounds, "case {case}");
    }
}
