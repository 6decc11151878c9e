//! Entity trait and entity identity.
//!
//! An [`Entity`] is a plain struct mapped to one table. Its lazy relationship
//! attributes are [`ValueHolder`]s; everything else travels through
//! [`Entity::to_row`] and [`Entity::from_row`].

use crate::Result;
use crate::error::{Error, TypeError};
use crate::lazy::ValueHolder;
use crate::producer::LoadContext;
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A shared, lockable entity instance.
///
/// Both the shared cache and every unit of work hand out entities this way,
/// so two lookups of the same key observe the same instance.
pub type Managed<E> = Arc<parking_lot::RwLock<E>>;

/// A type-erased [`Managed`] entity. Downcast with
/// `Arc::downcast::<parking_lot::RwLock<E>>()`.
pub type ErasedEntity = Arc<dyn Any + Send + Sync>;

/// Recover a typed entity from its erased form.
pub fn downcast_entity<E: Entity>(erased: ErasedEntity) -> Option<Managed<E>> {
    erased.downcast::<parking_lot::RwLock<E>>().ok()
}

/// Identity of one persisted row: the entity kind plus its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityKey {
    kind: String,
    pk: Vec<Value>,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, pk: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            pk,
        }
    }

    /// Build the key of the row `row` of kind `kind`.
    pub fn from_row(kind: &str, pk_columns: &[&str], row: &Row) -> Result<Self> {
        let pk = pk_columns
            .iter()
            .map(|col| {
                row.get_by_name(col).cloned().ok_or_else(|| {
                    Error::TypeMismatch(TypeError::new("primary key", "missing").in_column(*col))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(kind, pk))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn pk(&self) -> &[Value] {
        &self.pk
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.pk.len().hash(state);
        for v in &self.pk {
            v.hash_into(state);
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.kind)?;
        for (i, v) in self.pk.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match v {
                Value::Text(s) => f.write_str(s)?,
                other => match other.as_i64() {
                    Some(n) => write!(f, "{n}")?,
                    None => write!(f, "{other:?}")?,
                },
            }
        }
        f.write_str("]")
    }
}

/// Rewrites the value holders of an entity, one relationship attribute at
/// a time.
///
/// The session uses mappers to turn a shared-cache original into a working
/// copy (wrapping each reference in a working-copy decorator) and to turn a
/// committed working copy back into an original. Relationship values are
/// `PartialEq` so a working copy can tell whether one was edited.
pub trait HolderMapper {
    fn map<T: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        attribute: &'static str,
        holder: &ValueHolder<T>,
    ) -> Result<ValueHolder<T>>;
}

/// A struct persisted as one row of the table named by [`Entity::KIND`].
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct Account {
///     id: i64,
///     balance: i64,
///     version: i64,
///     owner_id: Option<i64>,
///     owner: ValueHolder<Option<Customer>>,
/// }
///
/// impl Entity for Account {
///     const KIND: &'static str = "accounts";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///
///     fn map_holders<M: HolderMapper>(&self, mapper: &M) -> Result<Self> {
///         Ok(Self { owner: mapper.map("owner", &self.owner)?, ..self.clone() })
///     }
///     // ...
/// }
/// ```
pub trait Entity: Clone + Send + Sync + 'static {
    /// Table (and cache namespace) of this entity.
    const KIND: &'static str;

    /// The primary key column name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Get the value of the primary key field(s).
    fn primary_key_value(&self) -> Vec<Value>;

    /// Convert this entity to a row of column values.
    ///
    /// Relationship attributes are not columns; their foreign keys are.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an entity from a row. Relationship attributes are built as
    /// deferred references through `ctx`.
    fn from_row(row: &Row, ctx: &LoadContext) -> Result<Self>;

    /// Assign a single column. Used to store new lock markers in the object.
    fn set_column(&mut self, column: &str, value: &Value) -> Result<()>;

    /// Rebuild this entity with every relationship holder passed through
    /// `mapper`. Entities without relationships keep the default.
    fn map_holders<M: HolderMapper>(&self, mapper: &M) -> Result<Self> {
        let _ = mapper;
        Ok(self.clone())
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(Self::KIND, self.primary_key_value())
    }
}
