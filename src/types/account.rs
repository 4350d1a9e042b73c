#[derive(Debug, Serialize, Deserialize)]
pub struct Account {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed", default)]
    pub terms_of_service_agreed: bool,
    #[serde(default)]
    pub orders: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountCreate {
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed", default)]
    pub terms_of_service_agreed: bool,
    #[serde(rename = "onlyReturnExisting", default)]
    pub only_return_existing: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    #[serde(rename = "valid")]
    Valid,
    #[serde(rename = "deactivated")]
    Deactivated,
}

impl Default for Status {
    fn default() -> Status {
        Status::Valid
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyChange {
    pub account: String,
    #[serde(rename = "oldKey")]
    pub old_key: super::jose::JWK,
}
