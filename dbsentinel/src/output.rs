//! JSON output of command results.

use anyhow::{Context, Result};
use serde::Serialize;

/// Renders a value as pretty JSON.
///
/// # Errors
/// Fails when the value cannot be serialized.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("JSON serialization")
}

/// Prints a value as pretty JSON on stdout.
///
/// # Errors
/// Fails when the value cannot be serialized.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", to_json(value)?);
    Ok(())
}
