use pmbb_error::{PmbbError, Result};
use pmbb_types::BadBlock;

/// Append without aborting the process on exhaustion. On failure the caller
/// drops the whole list.
pub(crate) fn push_record(
    records: &mut Vec<BadBlock>,
    what: &'static str,
    record: BadBlock,
) -> Result<()> {
    records
        .try_reserve(1)
        .map_err(|_| PmbbError::AllocationFailed {
            what,
            requested: records.len().saturating_add(1),
        })?;
    records.push(record);
    Ok(())
}
