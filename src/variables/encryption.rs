use anyhow::{Context, Result};
use serde_json::Value;

/// String-in, string-out cipher used for sensitive variable values.
pub trait VariableEncryption: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Identity cipher for deployments that keep secrets out of the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextEncryption;

impl VariableEncryption for PlaintextEncryption {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// Non-string values go through the cipher as their JSON text.
fn as_cipher_input(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Encrypt a plaintext value into a JSON string.
pub fn seal(encryption: &dyn VariableEncryption, value: &Value) -> Result<Value> {
    let ciphertext = encryption
        .encrypt(&as_cipher_input(value))
        .context("Failed to encrypt sensitive value")?;
    Ok(Value::String(ciphertext))
}

/// Decrypt a stored sensitive value. The result is always a JSON string.
pub fn open(encryption: &dyn VariableEncryption, value: &Value) -> Result<Value> {
    let plaintext = encryption
        .decrypt(&as_cipher_input(value))
        .context("Failed to decrypt sensitive value")?;
    Ok(Value::String(plaintext))
}
