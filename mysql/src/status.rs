use sqlx::mysql::MySqlRow;
use sqlx::Row;

use consensus::GtidPosition;

use crate::{MysqlError, Result};

/// Position a replica has read up to in its source's binlog.
pub fn slave_position(row: &MySqlRow) -> Result<GtidPosition> {
    let log_file = text_column(row, "Master_Log_File")?;
    let offset = offset_column(row, "Read_Master_Log_Pos")?;
    position_from(log_file, offset)
}

/// Head of the server's own binlog.
pub fn master_position(row: &MySqlRow) -> Result<GtidPosition> {
    let log_file = text_column(row, "File")?;
    let offset = offset_column(row, "Position")?;
    position_from(log_file, offset)
}

fn text_column(row: &MySqlRow, column: &str) -> Result<Option<String>> {
    Ok(row.try_get::<Option<String>, _>(column)?)
}

// Offsets come back unsigned from some servers and signed from others.
fn offset_column(row: &MySqlRow, column: &str) -> Result<Option<u64>> {
    if let Ok(value) = row.try_get::<Option<u64>, _>(column) {
        return Ok(value);
    }
    match row.try_get::<Option<i64>, _>(column)? {
        Some(value) if value < 0 => Err(MysqlError::Database(sqlx::Error::Protocol(format!(
            "negative {} reported: {}",
            column, value
        )))),
        value => Ok(value.map(|v| v as u64)),
    }
}

fn position_from(log_file: Option<String>, offset: Option<u64>) -> Result<GtidPosition> {
    match (log_file, offset) {
        (Some(log_file), Some(offset)) if !log_file.is_empty() => Ok(GtidPosition::new(log_file, offset)),
        (log_file, offset) => Err(MysqlError::Database(sqlx::Error::Protocol(format!(
            "incomplete replication status (file {:?}, offset {:?})",
            log_file, offset
        )))),
    }
}
