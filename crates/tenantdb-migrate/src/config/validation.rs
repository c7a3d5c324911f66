//! Configuration validation.

use crate::error::{MigrateError, Result};

use super::types::Config;

fn err(msg: impl Into<String>) -> MigrateError {
    MigrateError::Config(msg.into())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.database.host.is_empty() {
        return Err(err("database.host must not be empty"));
    }
    if config.database.port == 0 {
        return Err(err("database.port must not be 0"));
    }
    if config.database.database.is_empty() {
        return Err(err("database.database must not be empty"));
    }
    if config.database.user.is_empty() {
        return Err(err("database.user must not be empty"));
    }

    if config.schema.data_schema.is_empty() {
        return Err(err("schema.data_schema must not be empty"));
    }
    if config.schema.admin_schema.is_empty() {
        return Err(err("schema.admin_schema must not be empty"));
    }
    if config.schema.data_schema == config.schema.admin_schema {
        return Err(err(
            "schema.data_schema and schema.admin_schema must differ",
        ));
    }

    if config.lease.ttl_secs == 0 {
        return Err(err("lease.ttl_secs must be at least 1"));
    }
    if config.lease.max_attempts == 0 {
        return Err(err("lease.max_attempts must be at least 1"));
    }
    if config.lease.backoff_multiplier < 1.0 {
        return Err(err("lease.backoff_multiplier must be at least 1.0"));
    }

    Ok(())
}
