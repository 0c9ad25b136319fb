//! End-to-end scenarios exercising the public `Database`/`Model` surface:
//! insert + unique lookup, inner/left join, group-by aggregation, a
//! correlated sub-query aggregate, and schema migration.

use pauldb::agg::{Count, MinMax};
use pauldb::expr::{ColumnRef, Compare, CompareOp, Literal, SubQuery};
use pauldb::plan::{Aggregate, Filter, GroupBy, Join, LeftJoin, PlanNode, Select, SelectColumn, TableScan};
use pauldb::record::{Column, Record, Schema};
use pauldb::seq::MultiRow;
use pauldb::value::{nullable, FloatType, I32Type, SerialType, StringType, U32Type, Value};
use pauldb::{Database, QueryRow};
use std::rc::Rc;

fn single(row: &QueryRow) -> Rc<Record> {
    match row {
        QueryRow::Single(record) => record.clone(),
        QueryRow::Multi(_) => panic!("expected a single-table row"),
    }
}

#[tokio::test]
async fn s1_insert_and_unique_lookup() {
    let db = Database::in_memory().await.unwrap();
    let model = db.get_model("app");

    let schema = Rc::new(
        Schema::new(
            1,
            1,
            vec![Column::new("id", Rc::new(U32Type)).unique(), Column::new("name", Rc::new(StringType))],
            0,
        )
        .unwrap(),
    );
    let users = model.table("users", schema, true).await.unwrap();

    assert!(users.index_storage_id("id").is_none());

    users
        .insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("Mr. Blue"))]))
        .await
        .unwrap();

    assert!(users.index_storage_id("id").is_some());

    let found = users.lookup_unique("id", &Value::U32(1)).await.unwrap().unwrap();
    assert_eq!(found.get("name"), Some(&Value::str("Mr. Blue")));

    let err = users
        .insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("Someone Else"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, pauldb::error::Error::UniqueViolation { ref index } if index == "id"));
}

struct CatsHumans {
    cats_schema: Rc<Schema>,
    humans_schema: Rc<Schema>,
    owners_schema: Rc<Schema>,
}

async fn seed_cats_and_humans(model: &pauldb::Model, with_unowned_cat: bool) -> CatsHumans {
    let cats_schema = Rc::new(
        Schema::new(
            1,
            1,
            vec![
                Column::new("id", Rc::new(SerialType)).unique(),
                Column::new("name", Rc::new(StringType)),
                Column::new("age", Rc::new(I32Type)),
            ],
            0,
        )
        .unwrap(),
    );
    let humans_schema = Rc::new(
        Schema::new(
            2,
            1,
            vec![Column::new("id", Rc::new(SerialType)).unique(), Column::new("firstName", Rc::new(StringType))],
            0,
        )
        .unwrap(),
    );
    let owners_schema = Rc::new(
        Schema::new(
            3,
            1,
            vec![Column::new("petId", Rc::new(U32Type)), Column::new("ownerId", Rc::new(U32Type))],
            0,
        )
        .unwrap(),
    );

    let cats = model.table("cats", cats_schema.clone(), true).await.unwrap();
    let humans = model.table("humans", humans_schema.clone(), true).await.unwrap();
    let owners = model.table("catOwners", owners_schema.clone(), true).await.unwrap();

    cats.insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("fluffy")), ("age", Value::I32(3))]))
        .await
        .unwrap();
    cats.insert(Record::from_pairs([("id", Value::U32(2)), ("name", Value::str("mittens")), ("age", Value::I32(5))]))
        .await
        .unwrap();
    if with_unowned_cat {
        cats.insert(Record::from_pairs([("id", Value::U32(3)), ("name", Value::str("Mr. Blue")), ("age", Value::I32(16))]))
            .await
            .unwrap();
    }

    humans.insert(Record::from_pairs([("id", Value::U32(1)), ("firstName", Value::str("Alice"))])).await.unwrap();
    humans.insert(Record::from_pairs([("id", Value::U32(2)), ("firstName", Value::str("Bob"))])).await.unwrap();

    owners.insert(Record::from_pairs([("petId", Value::U32(1)), ("ownerId", Value::U32(1))])).await.unwrap();
    owners.insert(Record::from_pairs([("petId", Value::U32(1)), ("ownerId", Value::U32(2))])).await.unwrap();
    owners.insert(Record::from_pairs([("petId", Value::U32(2)), ("ownerId", Value::U32(2))])).await.unwrap();

    CatsHumans { cats_schema, humans_schema, owners_schema }
}

/// `catOwners` inner-joined with `humans`, under aliases `co`/`h`.
fn owner_join(schemas: &CatsHumans) -> Rc<dyn PlanNode> {
    Rc::new(Join {
        left: TableScan::new("app", "catOwners", "co", schemas.owners_schema.clone()),
        right: TableScan::new("app", "humans", "h", schemas.humans_schema.clone()),
        predicate: Rc::new(Compare {
            left: ColumnRef::new("co", Column::new("ownerId", Rc::new(U32Type))),
            op: CompareOp::Eq,
            right: ColumnRef::new("h", Column::new("id", Rc::new(SerialType))),
        }),
    })
}

fn cat_owner_select(cats_and_owners: Rc<dyn PlanNode>) -> Rc<dyn PlanNode> {
    Rc::new(Select {
        child: cats_and_owners,
        alias: "$0".to_string(),
        columns: vec![
            SelectColumn { name: "catName".to_string(), expr: ColumnRef::new("c", Column::new("name", Rc::new(StringType))) },
            SelectColumn {
                name: "owner".to_string(),
                expr: ColumnRef::new("h", Column::new("firstName", nullable(Rc::new(StringType)))),
            },
        ],
    })
}

#[tokio::test]
async fn s2_inner_join_select() {
    let db = Database::in_memory().await.unwrap();
    let model = db.get_model("app");
    let schemas = seed_cats_and_humans(&model, false).await;

    let joined: Rc<dyn PlanNode> = Rc::new(Join {
        left: TableScan::new("app", "cats", "c", schemas.cats_schema.clone()),
        right: owner_join(&schemas),
        predicate: Rc::new(Compare {
            left: ColumnRef::new("c", Column::new("id", Rc::new(SerialType))),
            op: CompareOp::Eq,
            right: ColumnRef::new("co", Column::new("petId", Rc::new(U32Type))),
        }),
    });

    let rows = model.query(cat_owner_select(joined)).await.unwrap();
    let pairs: Vec<(Value, Value)> = rows
        .iter()
        .map(|r| {
            let rec = single(r);
            (rec.get("catName").unwrap().clone(), rec.get("owner").unwrap().clone())
        })
        .collect();

    assert_eq!(
        pairs,
        vec![
            (Value::str("fluffy"), Value::str("Alice")),
            (Value::str("fluffy"), Value::str("Bob")),
            (Value::str("mittens"), Value::str("Bob")),
        ]
    );
}

#[tokio::test]
async fn s3_left_join_with_unmatched_row() {
    let db = Database::in_memory().await.unwrap();
    let model = db.get_model("app");
    let schemas = seed_cats_and_humans(&model, true).await;

    let joined: Rc<dyn PlanNode> = Rc::new(LeftJoin {
        left: TableScan::new("app", "cats", "c", schemas.cats_schema.clone()),
        right: owner_join(&schemas),
        predicate: Rc::new(Compare {
            left: ColumnRef::new("c", Column::new("id", Rc::new(SerialType))),
            op: CompareOp::Eq,
            right: ColumnRef::new("co", Column::new("petId", Rc::new(U32Type))),
        }),
    });

    let rows = model.query(cat_owner_select(joined)).await.unwrap();
    let pairs: Vec<(Value, Value)> = rows
        .iter()
        .map(|r| {
            let rec = single(r);
            (rec.get("catName").unwrap().clone(), rec.get("owner").unwrap().clone())
        })
        .collect();

    assert_eq!(
        pairs,
        vec![
            (Value::str("fluffy"), Value::str("Alice")),
            (Value::str("fluffy"), Value::str("Bob")),
            (Value::str("mittens"), Value::str("Bob")),
            (Value::str("Mr. Blue"), Value::Null),
        ]
    );
}

#[tokio::test]
async fn s4_group_by_max() {
    let db = Database::in_memory().await.unwrap();
    let model = db.get_model("app");

    let schema = Rc::new(
        Schema::new(
            1,
            1,
            vec![
                Column::new("name", Rc::new(StringType)),
                Column::new("category", Rc::new(StringType)),
                Column::new("color", Rc::new(StringType)),
                Column::new("price", Rc::new(FloatType)),
            ],
            0,
        )
        .unwrap(),
    );
    let products = model.table("products", schema.clone(), true).await.unwrap();

    let rows = [
        ("apple", "fruit", "red", 1.0),
        ("cherry", "fruit", "red", 0.5),
        ("banana", "fruit", "yellow", 0.5),
        ("carrot", "veg", "orange", 0.25),
        ("lettuce", "veg", "green", 0.75),
        ("tomato", "fruit", "red", 0.75),
        ("cucumber", "veg", "green", 0.5),
        ("potato", "veg", "brown", 0.25),
    ];
    for (name, category, color, price) in rows {
        products
            .insert(Record::from_pairs([
                ("name", Value::str(name)),
                ("category", Value::str(category)),
                ("color", Value::str(color)),
                ("price", Value::Float(price)),
            ]))
            .await
            .unwrap();
    }

    let plan: Rc<dyn PlanNode> = Rc::new(GroupBy {
        child: TableScan::new("app", "products", "p", schema),
        group_keys: vec![
            ("category".to_string(), ColumnRef::new("p", Column::new("category", Rc::new(StringType)))),
            ("color".to_string(), ColumnRef::new("p", Column::new("color", Rc::new(StringType)))),
        ],
        aggregations: vec![
            ("count".to_string(), Rc::new(Count { of: None })),
            ("maxPrice".to_string(), MinMax::max(ColumnRef::new("p", Column::new("price", Rc::new(FloatType)))).unwrap()),
        ],
        alias: "$0".to_string(),
    });

    let rows = model.query(plan).await.unwrap();
    let actual: Vec<(Value, Value, Value, Value)> = rows
        .iter()
        .map(|r| {
            let rec = single(r);
            (
                rec.get("category").unwrap().clone(),
                rec.get("color").unwrap().clone(),
                rec.get("count").unwrap().clone(),
                rec.get("maxPrice").unwrap().clone(),
            )
        })
        .collect();

    assert_eq!(
        actual,
        vec![
            (Value::str("fruit"), Value::str("red"), Value::I32(3), Value::Float(1.0)),
            (Value::str("fruit"), Value::str("yellow"), Value::I32(1), Value::Float(0.5)),
            (Value::str("veg"), Value::str("orange"), Value::I32(1), Value::Float(0.25)),
            (Value::str("veg"), Value::str("green"), Value::I32(2), Value::Float(0.75)),
            (Value::str("veg"), Value::str("brown"), Value::I32(1), Value::Float(0.25)),
        ]
    );
}

#[tokio::test]
async fn s5_correlated_subquery_aggregate() {
    let db = Database::in_memory().await.unwrap();
    let model = db.get_model("app");
    let schemas = seed_cats_and_humans(&model, false).await;

    let humans = model.table("humans", schemas.humans_schema.clone(), true).await.unwrap();
    humans.insert(Record::from_pairs([("id", Value::U32(3)), ("firstName", Value::str("Charlie"))])).await.unwrap();

    let owners_schema = schemas.owners_schema.clone();
    let subquery: pauldb::expr::ExprRef = Rc::new(SubQuery {
        build: Rc::new(move |row: &MultiRow| -> Rc<dyn PlanNode> {
            let owner_id = row.get("h").and_then(|r| r.get("id")).cloned().expect("humans row carries id");
            Rc::new(Aggregate {
                child: Rc::new(Filter {
                    child: TableScan::new("app", "catOwners", "co", owners_schema.clone()),
                    predicate: Rc::new(Compare {
                        left: ColumnRef::new("co", Column::new("ownerId", Rc::new(U32Type))),
                        op: CompareOp::Eq,
                        right: Literal::new(owner_id, Rc::new(U32Type)).expect("human id is a valid uint32"),
                    }),
                }),
                aggregations: vec![("count".to_string(), Rc::new(Count { of: None }))],
                alias: "$0".to_string(),
            })
        }),
        result_type: Rc::new(I32Type),
    });

    let plan: Rc<dyn PlanNode> = Rc::new(Select {
        child: TableScan::new("app", "humans", "h", schemas.humans_schema),
        alias: "$0".to_string(),
        columns: vec![
            SelectColumn { name: "firstName".to_string(), expr: ColumnRef::new("h", Column::new("firstName", Rc::new(StringType))) },
            SelectColumn { name: "catCount".to_string(), expr: subquery },
        ],
    });

    let rows = model.query(plan).await.unwrap();
    let actual: Vec<(Value, Value)> = rows
        .iter()
        .map(|r| {
            let rec = single(r);
            (rec.get("firstName").unwrap().clone(), rec.get("catCount").unwrap().clone())
        })
        .collect();

    assert_eq!(
        actual,
        vec![
            (Value::str("Alice"), Value::I32(1)),
            (Value::str("Bob"), Value::I32(2)),
            (Value::str("Charlie"), Value::I32(0)),
        ]
    );
}

#[tokio::test]
async fn s6_migration_adds_column() {
    let db = Database::in_memory().await.unwrap();
    let model = db.get_model("app");

    let schema = Rc::new(
        Schema::new(
            1,
            1,
            vec![Column::new("id", Rc::new(U32Type)).unique(), Column::new("name", Rc::new(StringType))],
            0,
        )
        .unwrap(),
    );
    let users = model.table("users", schema, true).await.unwrap();
    users
        .insert(Record::from_pairs([("id", Value::U32(1)), ("name", Value::str("Mr. Blue"))]))
        .await
        .unwrap();

    let new_schema = Rc::new(
        Schema::new(
            1,
            2,
            vec![
                Column::new("id", Rc::new(U32Type)).unique(),
                Column::new("name", Rc::new(StringType)),
                Column::new("age", Rc::new(U32Type)),
            ],
            0,
        )
        .unwrap(),
    );
    let migrated = model
        .migrate_table("users", new_schema, |mut row| {
            row.0.insert("age".to_string(), Value::U32(42));
            row
        })
        .await
        .unwrap();

    let found = migrated.lookup_unique("id", &Value::U32(1)).await.unwrap().unwrap();
    assert_eq!(found.get("name"), Some(&Value::str("Mr. Blue")));
    assert_eq!(found.get("age"), Some(&Value::U32(42)));

    let old_err = users.lookup_unique("id", &Value::U32(1)).await.unwrap_err();
    assert!(matches!(old_err, pauldb::error::Error::Dropped));
}
