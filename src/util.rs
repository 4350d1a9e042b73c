use base64::prelude::*;

pub fn uuid_as_b64(uuid: &uuid::Uuid) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

pub fn b64_to_uuid(b64: &str) -> Option<uuid::Uuid> {
    let uuid_bytes = match BASE64_URL_SAFE_NO_PAD.decode(b64) {
        Ok(n) => n,
        Err(_) => {
            return None;
        }
    };
    let uuid_obj = match uuid::Uuid::from_slice(&uuid_bytes) {
        Ok(u) => u,
        Err(_) => {
            return None
        }
    };
    Some(uuid_obj)
}

/// Base64url with or without trailing padding, as some clients still pad.
pub fn decode_b64_url(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))
}

pub fn random_token(len: usize) -> Result<String, openssl::error::ErrorStack> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf)?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(&buf))
}

pub fn sha256_b64(data: &[u8]) -> Result<String, openssl::error::ErrorStack> {
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), data)?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(&digest))
}

pub fn asn1_time_to_chrono(
    time: &openssl::asn1::Asn1TimeRef
) -> Result<chrono::DateTime<chrono::Utc>, openssl::error::ErrorStack> {
    use chrono::offset::TimeZone;
    let epoch = openssl::asn1::Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = diff.days as i64 * 86400 + diff.secs as i64;
    Ok(chrono::Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
}

pub fn error_list_to_result<D: Into<Option<String>>>(
    mut errors: Vec<crate::types::error::Error>, compound_detail: D
) -> Result<(), crate::types::error::Error> {
    if errors.len() <= 1 {
        return match errors.pop() {
            Some(e) => Err(e),
            None => Ok(())
        };
    }

    Err(crate::types::error::Error {
        error_type: crate::types::error::Type::Compound,
        status: 400,
        title: "Compound errors".to_string(),
        detail: match compound_detail.into() {
            Some(d) => d,
            None => "Multiple errors make this request invalid".to_string(),
        },
        sub_problems: errors,
        instance: None,
        identifier: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::error::{Error, Type};

    #[test]
    fn test_uuid_b64_round_trip() {
        let id = uuid::Uuid::new_v4();
        let encoded = uuid_as_b64(&id);
        assert_eq!(encoded.len(), 22);
        assert_eq!(b64_to_uuid(&encoded), Some(id));
        assert_eq!(b64_to_uuid("not-a-uuid"), None);
    }

    #[test]
    fn test_error_list_to_result() {
        assert!(error_list_to_result(vec![], None).is_ok());

        let single = error_list_to_result(vec![Error::malformed("one")], None).unwrap_err();
        assert_eq!(single.error_type, Type::Malformed);
        assert!(single.sub_problems.is_empty());

        let compound = error_list_to_result(vec![
            Error::malformed("one"),
            Error::new(Type::RejectedIdentifier, "Invalid identifier", "two"),
        ], "Invalid identifiers".to_string()).unwrap_err();
        assert_eq!(compound.error_type, Type::Compound);
        assert_eq!(compound.detail, "Invalid identifiers");
        assert_eq!(compound.sub_problems.len(), 2);
    }

    #[test]
    fn test_asn1_time_to_chrono() {
        let t = openssl::asn1::Asn1Time::from_unix(1_700_000_000).unwrap();
        assert_eq!(asn1_time_to_chrono(&t).unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_random_token_length() {
        let token = random_token(32).unwrap();
        assert_eq!(decode_b64_url(&token).unwrap().len(), 32);
        assert_ne!(token, random_token(32).unwrap());
    }
}
