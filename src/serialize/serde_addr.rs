//! Target addresses as `"0x..."` strings. Deserialization also takes plain
//! integers, since hand-written target descriptions tend to mix the two.

use std::fmt;

use serde::{de::Visitor, Deserializer, Serializer};

pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{value:#x}"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(AddrVisitor)
}

/// Parse `0x`-prefixed hex or plain decimal
pub fn parse_addr(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => s.parse().ok(),
    }
}

struct AddrVisitor;

impl<'de> Visitor<'de> for AddrVisitor {
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an address, as an integer or a \"0x\" hex string")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v)
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(v).map_err(|_| E::custom(format!("negative address {v}")))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        parse_addr(v).ok_or_else(|| E::custom(format!("invalid address {v:?}")))
    }
}

#[derive(serde::Deserialize)]
struct Addr(#[serde(with = "crate::serialize::serde_addr")] u64);

/// Same as the parent module, for `Option<u64>`; `None` is `null`
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Addr;

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(addr) => super::serialize(addr, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Addr>::deserialize(deserializer)?.map(|Addr(addr)| addr))
    }
}

/// Same as the parent module, for `HashMap<String, u64>` values
pub mod map {
    use std::fmt;

    use hashbrown::HashMap;
    use serde::{
        de::{MapAccess, Visitor},
        ser::SerializeMap,
        Deserializer, Serializer,
    };

    use super::Addr;

    pub fn serialize<S>(value: &HashMap<String, u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for (k, v) in value {
            map.serialize_entry(k, &format!("{v:#x}"))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(AddrMapVisitor)
    }

    struct AddrMapVisitor;

    impl<'de> Visitor<'de> for AddrMapVisitor {
        type Value = HashMap<String, u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of names to addresses")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut out = HashMap::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((k, Addr(v))) = access.next_entry::<String, Addr>()? {
                out.insert(k, v);
            }
            Ok(out)
        }
    }
}
