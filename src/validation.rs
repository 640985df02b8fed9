//! Input validation for seller and buyer supplied fields.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::MIN_PRICE;
use crate::error::{CifraError, Result};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"));

static PROMO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("valid promo pattern"));

pub fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    if email.is_empty() {
        return Err(CifraError::Validation("email is required".to_string()));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(CifraError::Validation(format!(
            "'{email}' is not a valid email address"
        )));
    }
    Ok(())
}

pub fn validate_price(price: i64) -> Result<()> {
    if price <= 0 {
        return Err(CifraError::Validation(
            "price must be a positive number".to_string(),
        ));
    }
    if price < MIN_PRICE {
        return Err(CifraError::Validation(format!(
            "minimum price is {MIN_PRICE} to cover payment processing fees"
        )));
    }
    Ok(())
}

pub fn validate_promo_code(code: &str) -> Result<()> {
    let code = code.trim();
    if code.is_empty() {
        return Err(CifraError::Validation("promo code is required".to_string()));
    }
    if code.chars().count() < 3 {
        return Err(CifraError::Validation(
            "promo code must be at least 3 characters".to_string(),
        ));
    }
    if code.chars().count() > 50 {
        return Err(CifraError::Validation(
            "promo code must be at most 50 characters".to_string(),
        ));
    }
    if !PROMO_RE.is_match(code) {
        return Err(CifraError::Validation(
            "promo code may contain only letters, digits and hyphens".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_discount_percent(percent: i64) -> Result<()> {
    if !(0..=100).contains(&percent) {
        return Err(CifraError::Validation(
            "discount percent must be between 0 and 100".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_product_title(title: &str) -> Result<()> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(CifraError::Validation("title is required".to_string()));
    }
    if trimmed.chars().count() < 3 {
        return Err(CifraError::Validation(
            "title must be at least 3 characters".to_string(),
        ));
    }
    if title.chars().count() > 200 {
        return Err(CifraError::Validation(
            "title must be at most 200 characters".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_product_description(description: &str) -> Result<()> {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        return Err(CifraError::Validation("description is required".to_string()));
    }
    if trimmed.chars().count() < 10 {
        return Err(CifraError::Validation(
            "description must be at least 10 characters".to_string(),
        ));
    }
    Ok(())
}
