//! Serde adapter for [`Amount`] fields that come from config files.
//!
//! TOML integers and most config sources stop at 64 bits, so an amount is
//! written as a number when it fits in `u64` and as a decimal string otherwise.
//! Both forms are accepted on input.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::Amount;

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Narrow(u64),
    Text(String),
}

impl Repr {
    fn from_amount(amount: Amount) -> Self {
        match u64::try_from(amount) {
            Ok(narrow) => Repr::Narrow(narrow),
            Err(_) => Repr::Text(amount.to_string()),
        }
    }

    fn into_amount<E: serde::de::Error>(self) -> Result<Amount, E> {
        match self {
            Repr::Narrow(n) => Ok(n as Amount),
            Repr::Text(s) => s
                .trim()
                .parse::<Amount>()
                .map_err(|e| E::custom(format!("invalid amount {s:?}: {e}"))),
        }
    }
}

pub fn serialize<S>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    Repr::from_amount(*amount).serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
where
    D: Deserializer<'de>,
{
    Repr::deserialize(deserializer)?.into_amount()
}

/// The same encoding for `Option<Amount>`.
pub mod option {
    use super::*;

    pub fn serialize<S>(amount: &Option<Amount>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        amount.map(Repr::from_amount).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Amount>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Repr>::deserialize(deserializer)?
            .map(Repr::into_amount)
            .transpose()
    }
}
