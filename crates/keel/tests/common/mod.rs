#![allow(dead_code)]

use keel::prelude::*;
use keel::{Datastore, Error};

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: i64,
    pub name: String,
}

impl Entity for Customer {
    const KIND: &'static str = "customers";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::from(self.name.as_str())),
        ]
    }

    fn from_row(row: &Row, _ctx: &LoadContext) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }

    fn set_column(&mut self, _column: &str, _value: &Value) -> Result<()> {
        Ok(())
    }
}

/// Counter-locked account with a lazily loaded owner.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub balance: i64,
    pub version: i64,
    pub owner_id: i64,
    pub owner: ValueHolder<Option<Customer>>,
}

pub fn account_owner(account: &Account) -> &ValueHolder<Option<Customer>> {
    &account.owner
}

impl Entity for Account {
    const KIND: &'static str = "accounts";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("balance", Value::BigInt(self.balance)),
            ("version", Value::BigInt(self.version)),
            ("owner_id", Value::BigInt(self.owner_id)),
        ]
    }

    fn from_row(row: &Row, ctx: &LoadContext) -> Result<Self> {
        let owner_id: i64 = row.get_named("owner_id")?;
        Ok(Self {
            id: row.get_named("id")?,
            balance: row.get_named("balance")?,
            version: row.get_named("version")?,
            owner_id,
            owner: ctx.lazy_one::<Customer>(owner_id),
        })
    }

    fn set_column(&mut self, column: &str, value: &Value) -> Result<()> {
        match column {
            "version" => self.version = i64::try_from(value.clone())?,
            "balance" => self.balance = i64::try_from(value.clone())?,
            _ => {}
        }
        Ok(())
    }

    fn map_holders<M: HolderMapper>(&self, mapper: &M) -> Result<Self> {
        Ok(Self {
            owner: mapper.map("owner", &self.owner)?,
            ..self.clone()
        })
    }
}

/// Ledger whose customer is read with a row lock inside transactions.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub id: i64,
    pub customer_id: i64,
    pub customer: ValueHolder<Option<Customer>>,
}

pub fn ledger_customer(ledger: &Ledger) -> &ValueHolder<Option<Customer>> {
    &ledger.customer
}

impl Entity for Ledger {
    const KIND: &'static str = "ledgers";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("customer_id", Value::BigInt(self.customer_id)),
        ]
    }

    fn from_row(row: &Row, ctx: &LoadContext) -> Result<Self> {
        let customer_id: i64 = row.get_named("customer_id")?;
        Ok(Self {
            id: row.get_named("id")?,
            customer_id,
            customer: ctx.lazy_one_locking::<Customer>(customer_id),
        })
    }

    fn set_column(&mut self, _column: &str, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn map_holders<M: HolderMapper>(&self, mapper: &M) -> Result<Self> {
        Ok(Self {
            customer: mapper.map("customer", &self.customer)?,
            ..self.clone()
        })
    }
}

/// Timestamp-locked document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub updated_at: i64,
}

impl Entity for Document {
    const KIND: &'static str = "documents";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("title", Value::from(self.title.as_str())),
            ("updated_at", Value::Timestamp(self.updated_at)),
        ]
    }

    fn from_row(row: &Row, _ctx: &LoadContext) -> Result<Self> {
        let updated_at = match row.get_by_name("updated_at") {
            Some(Value::Timestamp(micros)) => *micros,
            _ => return Err(Error::invalid_state("documents.updated_at must be a timestamp")),
        };
        Ok(Self {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
            updated_at,
        })
    }

    fn set_column(&mut self, column: &str, value: &Value) -> Result<()> {
        if let ("updated_at", Value::Timestamp(micros)) = (column, value) {
            self.updated_at = *micros;
        }
        Ok(())
    }
}

pub fn customer_row(id: i64, name: &str) -> Row {
    Row::from_pairs([("id", Value::BigInt(id)), ("name", Value::from(name))])
}

pub fn account_row(id: i64, balance: i64, version: i64, owner_id: i64) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("balance", Value::BigInt(balance)),
        ("version", Value::BigInt(version)),
        ("owner_id", Value::BigInt(owner_id)),
    ])
}

pub fn pk(id: i64) -> Vec<Value> {
    vec![Value::BigInt(id)]
}

/// A datastore with customers 1 and 2, accounts 10 (owner 1) and 11
/// (owner 2), and ledger 20 (customer 1).
pub fn bank_store() -> Arc<MemoryDatastore> {
    let store = Arc::new(MemoryDatastore::new("bank"));
    store.define_table("customers", &["id"]);
    store.define_table("accounts", &["id"]);
    store.define_table("ledgers", &["id"]);
    store.seed("customers", customer_row(1, "Ada")).expect("seed customer");
    store.seed("customers", customer_row(2, "Grace")).expect("seed customer");
    store.seed("accounts", account_row(10, 100, 1, 1)).expect("seed account");
    store.seed("accounts", account_row(11, 50, 1, 2)).expect("seed account");
    store
        .seed(
            "ledgers",
            Row::from_pairs([("id", Value::BigInt(20)), ("customer_id", Value::BigInt(1))]),
        )
        .expect("seed ledger");
    store
}

pub fn account_descriptor(policy: OptimisticLockPolicy) -> EntityDescriptor {
    EntityDescriptor::new::<Account>()
        .with_lock_policy(policy)
        .with_relationship("owner", account_owner)
        .depends_on("customers")
}

/// A shared session over [`bank_store`] with every bank kind described and
/// accounts guarded by a version counter.
pub fn bank_session(store: &Arc<MemoryDatastore>) -> Arc<SharedSession> {
    let shared = SharedSession::new(Arc::clone(store) as Arc<dyn Datastore>);
    shared.register_descriptor(EntityDescriptor::new::<Customer>());
    shared.register_descriptor(account_descriptor(OptimisticLockPolicy::counter("version")));
    shared.register_descriptor(
        EntityDescriptor::new::<Ledger>()
            .with_relationship("customer", ledger_customer)
            .depends_on("customers"),
    );
    shared
}
