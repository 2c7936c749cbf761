//! Keyring helpers for server credentials.

use keyring::Entry;

const SERVER_SERVICE_NAME: &str = "subtide.server";

fn server_entry(server_name: &str) -> Result<Entry, String> {
    Entry::new(SERVER_SERVICE_NAME, server_name)
        .map_err(|err| format!("failed to create keyring entry: {err}"))
}

/// Saves the password for a server into the OS keyring.
pub fn set_server_password(server_name: &str, password: &str) -> Result<(), String> {
    let entry = server_entry(server_name)?;
    entry
        .set_password(password)
        .map_err(|err| format!("failed to set keyring password: {err}"))
}

/// Loads the password for a server from the OS keyring.
pub fn get_server_password(server_name: &str) -> Result<Option<String>, String> {
    let entry = server_entry(server_name)?;
    match entry.get_password() {
        Ok(password) => Ok(Some(password)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(format!("failed to get keyring password: {err}")),
    }
}

/// Deletes the password for a server from the OS keyring.
pub fn delete_server_password(server_name: &str) -> Result<(), String> {
    let entry = server_entry(server_name)?;
    match entry.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(format!("failed to delete keyring password: {err}")),
    }
}
