use crate::error::AppError;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

pub fn require_valid_id(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} must be a valid ID")));
    }
    Ok(())
}

/// Longest accepted rotation interval, ten years of days.
pub const MAX_INTERVAL: i64 = 3650;

/// Rotation intervals are whole days, 1 to `MAX_INTERVAL`.
pub fn require_interval(field: &str, value: i64) -> Result<(), AppError> {
    if value < 1 {
        return Err(AppError::Validation(format!(
            "{field} must be at least 1 day"
        )));
    }
    if value > MAX_INTERVAL {
        return Err(AppError::Validation(format!(
            "{field} must be at most {MAX_INTERVAL} days"
        )));
    }
    Ok(())
}

/// Secret paths are absolute, slash separated (`/`, `/app/db`).
pub fn require_secret_path(field: &str, value: &str) -> Result<(), AppError> {
    require_non_empty(field, value)?;
    if !value.starts_with('/') {
        return Err(AppError::Validation(format!(
            "{field} must start with '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("environment", "prod").is_ok());
        assert!(require_non_empty("environment", "   ").is_err());
    }

    #[test]
    fn test_require_interval() {
        assert!(require_interval("interval", 1).is_ok());
        assert!(require_interval("interval", 0).is_err());
        assert!(require_interval("interval", -3).is_err());
        assert!(require_interval("interval", MAX_INTERVAL).is_ok());
        assert!(require_interval("interval", MAX_INTERVAL + 1).is_err());
        assert!(require_interval("interval", i64::MAX).is_err());
    }

    #[test]
    fn test_require_secret_path() {
        assert!(require_secret_path("secretPath", "/").is_ok());
        assert!(require_secret_path("secretPath", "/app/db").is_ok());
        assert!(require_secret_path("secretPath", "app").is_err());
        assert!(require_secret_path("secretPath", "").is_err());
    }
}
