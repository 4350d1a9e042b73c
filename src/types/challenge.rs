use chrono::prelude::*;

#[derive(Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub challenge_type: Type,
    pub url: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<super::error::Error>,
    pub token: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Type {
    #[serde(rename = "http-01")]
    HTTP01,
    #[serde(rename = "dns-01")]
    DNS01,
}

impl Type {
    pub fn from_str(challenge_type: &str) -> Option<Self> {
        match challenge_type {
            "http-01" => Some(Self::HTTP01),
            "dns-01" => Some(Self::DNS01),
            _ => None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HTTP01 => "http-01",
            Self::DNS01 => "dns-01",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "valid")]
    Valid,
    #[serde(rename = "invalid")]
    Invalid,
}

impl Default for Status {
    fn default() -> Status {
        Status::Pending
    }
}

#[derive(Deserialize, Debug)]
pub struct ChallengeRespond {}
