//! Currencies known to a tenant.
//!
//! Currency CRUD lives outside the engine. The engine only reads the table to
//! reject unknown codes and to format minor units for display.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine};

/// ISO-like currency as configured by a tenant.
///
/// ## Minor units
///
/// Every amount in the engine is an `i64` number of **minor units**.
/// `decimal_places` is how many digits separate major from minor units:
/// USD has 2, so `10.50 USD` ⇄ `1050`. JPY has 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Currency {
    pub code: String,
    pub name: String,
    pub symbol: String,
    pub decimal_places: u8,
}

impl Currency {
    /// Formats `amount_minor` using the currency symbol and decimal places.
    ///
    /// ```rust
    /// use engine::Currency;
    ///
    /// let usd = Currency {
    ///     code: "USD".to_string(),
    ///     name: "US Dollar".to_string(),
    ///     symbol: "$".to_string(),
    ///     decimal_places: 2,
    /// };
    /// assert_eq!(usd.format_minor(1050), "$10.50");
    /// assert_eq!(usd.format_minor(-5), "-$0.05");
    /// ```
    #[must_use]
    pub fn format_minor(&self, amount_minor: i64) -> String {
        let sign = if amount_minor < 0 { "-" } else { "" };
        let abs = amount_minor.unsigned_abs();
        if self.decimal_places == 0 {
            return format!("{sign}{}{abs}", self.symbol);
        }
        let scale = 10u64.pow(u32::from(self.decimal_places));
        let major = abs / scale;
        let minor = abs % scale;
        let width = usize::from(self.decimal_places);
        format!("{sign}{}{major}.{minor:0width$}", self.symbol)
    }
}

/// Normalizes a currency code for storage and comparison.
pub(crate) fn normalize_code(code: &str) -> ResultEngine<String> {
    let trimmed = code.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::InvalidRequest(format!(
            "invalid currency code: {code}"
        )));
    }
    Ok(trimmed.to_ascii_uppercase())
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "currencies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,
    pub name: String,
    pub symbol: String,
    pub decimal_places: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Currency {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let decimal_places = u8::try_from(model.decimal_places).map_err(|_| {
            EngineError::InvariantViolation(format!(
                "currency {} has invalid decimal places {}",
                model.code, model.decimal_places
            ))
        })?;
        Ok(Self {
            code: model.code,
            name: model.name,
            symbol: model.symbol,
            decimal_places,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn currency(decimal_places: u8) -> Currency {
        Currency {
            code: "XXX".to_string(),
            name: "Test".to_string(),
            symbol: "¤".to_string(),
            decimal_places,
        }
    }

    #[test]
    fn formats_zero_decimal_currencies() {
        assert_eq!(currency(0).format_minor(1234), "¤1234");
    }

    #[test]
    fn formats_three_decimal_currencies() {
        assert_eq!(currency(3).format_minor(1005), "¤1.005");
        assert_eq!(currency(3).format_minor(7), "¤0.007");
    }

    #[test]
    fn normalize_code_uppercases() {
        assert_eq!(normalize_code(" usd ").unwrap(), "USD");
        assert!(normalize_code("u-s").is_err());
        assert!(normalize_code("").is_err());
    }
}
