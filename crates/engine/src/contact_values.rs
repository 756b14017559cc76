//! Shared-mode attachments of generic codes to contacts.
//!
//! A shared generic Value is never copied: the contact gets a link row whose
//! id is content addressed on `(generic value id, contact id)`, so attaching
//! twice collides on the primary key.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactValue {
    pub id: String,
    pub value_id: String,
    pub contact_id: String,
    pub created_date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "contact_values")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub value_id: String,
    pub contact_id: String,
    pub created_date: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl ActiveModel {
    pub(crate) fn from_link(tenant_id: &str, link: &ContactValue) -> Self {
        Self {
            tenant_id: ActiveValue::Set(tenant_id.to_string()),
            id: ActiveValue::Set(link.id.clone()),
            value_id: ActiveValue::Set(link.value_id.clone()),
            contact_id: ActiveValue::Set(link.contact_id.clone()),
            created_date: ActiveValue::Set(link.created_date),
        }
    }
}

impl From<Model> for ContactValue {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            value_id: model.value_id,
            contact_id: model.contact_id,
            created_date: model.created_date,
        }
    }
}
