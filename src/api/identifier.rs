use serde::{Deserialize, Serialize};

/// An order identifier; only the `dns` type is meaningful to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn is_type_dns(&self) -> bool {
        self._type == "dns"
    }
}

impl From<&str> for Identifier {
    fn from(domain: &str) -> Self {
        Identifier::dns(domain)
    }
}

impl From<String> for Identifier {
    fn from(domain: String) -> Self {
        Identifier::dns(&domain)
    }
}
