#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Type {
    DNS,
    IP,
}

impl Type {
    pub fn from_str(id_type: &str) -> Option<Self> {
        match id_type {
            "dns" => Some(Self::DNS),
            "ip" => Some(Self::IP),
            _ => None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DNS => "dns",
            Self::IP => "ip",
        }
    }
}

impl Identifier {
    pub fn dns<V: Into<String>>(value: V) -> Self {
        Identifier {
            id_type: Type::DNS.as_str().to_string(),
            value: value.into(),
        }
    }

    pub fn ip(addr: std::net::IpAddr) -> Self {
        Identifier {
            id_type: Type::IP.as_str().to_string(),
            value: addr.to_string(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.id_type == "dns" && self.value.starts_with("*.")
    }
}
