use crate::limits::*;

use super::EngineError;

/// Trim and upper-case every code, then drop repeats keeping first-seen order.
pub fn normalize_seat_codes(raw: &[String]) -> Result<Vec<String>, EngineError> {
    if raw.is_empty() {
        return Err(EngineError::InvalidInput("seat codes must be a non-empty list".into()));
    }
    let mut codes: Vec<String> = Vec::with_capacity(raw.len());
    for code in raw {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err(EngineError::InvalidInput("empty seat code".into()));
        }
        if code.len() > MAX_SEAT_CODE_LEN {
            return Err(EngineError::LimitExceeded("seat code too long"));
        }
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    if codes.len() > MAX_SEATS_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many seats in one request"));
    }
    Ok(codes)
}

/// Blank user ids count as absent.
pub fn normalize_user_id(user_id: Option<String>) -> Result<Option<String>, EngineError> {
    let Some(user_id) = user_id else {
        return Ok(None);
    };
    let user_id = user_id.trim();
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok((!user_id.is_empty()).then(|| user_id.to_string()))
}

pub fn normalize_booking_code(code: &str) -> Result<String, EngineError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(EngineError::InvalidInput("booking code is required".into()));
    }
    if code.len() > MAX_BOOKING_CODE_LEN {
        return Err(EngineError::LimitExceeded("booking code too long"));
    }
    Ok(code.to_string())
}
