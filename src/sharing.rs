use crate::{device::Stream, grid::GridField, FluidError, Result};

/// Brackets compute access to surface-backed fields. Owned fields pass
/// through untouched, so callers can hand over every field they are about to
/// dispatch on without sorting them first.
pub struct SharingGate;

impl SharingGate {
    /// Acquires every shared field in order. If one fails, the fields
    /// acquired so far are released again before the error is returned.
    pub fn acquire_all(stream: &Stream, fields: &[&GridField]) -> Result<()> {
        stream.synchronize()?;
        for (i, field) in fields.iter().enumerate() {
            if !field.is_shared() {
                continue;
            }
            if let Err(e) = field.acquire(stream) {
                for done in fields[..i].iter().rev().filter(|f| f.is_shared()) {
                    if let Err(rollback) = done.release(stream) {
                        log::error!("rollback release failed: {}", rollback);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
    /// Waits for every recorded command, then hands the shared fields back
    /// to graphics in reverse order. All fields are attempted; the first
    /// failure is returned.
    pub fn release_all(stream: &Stream, fields: &[&GridField]) -> Result<()> {
        let mut first_error = stream.synchronize().err();
        if let Some(e) = &first_error {
            log::error!("{}", e);
        }
        for field in fields.iter().rev().filter(|f| f.is_shared()) {
            if let Err(e) = field.release(stream) {
                log::warn!("{}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
    pub fn acquire<'a>(stream: &'a Stream, fields: &[&'a GridField]) -> Result<SharedAccess<'a>> {
        Self::acquire_all(stream, fields)?;
        Ok(SharedAccess {
            stream,
            fields: fields.to_vec(),
            released: false,
        })
    }
}

/// An open compute window over a set of shared fields.
pub struct SharedAccess<'a> {
    stream: &'a Stream,
    fields: Vec<&'a GridField>,
    released: bool,
}

impl<'a> SharedAccess<'a> {
    pub fn stream(&self) -> &'a Stream {
        self.stream
    }
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        SharingGate::release_all(self.stream, &self.fields)
    }
}

impl<'a> Drop for SharedAccess<'a> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!(
            "shared access over {} fields dropped without release",
            self.fields.len()
        );
        if let Err(e) = SharingGate::release_all(self.stream, &self.fields) {
            log::error!("{}", e);
        }
    }
}

impl std::fmt::Debug for SharedAccess<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedAccess")
            .field("fields", &self.fields.len())
            .field("released", &self.released)
            .finish()
    }
}

pub(crate) fn expect_acquired(field: &GridField) -> Result<()> {
    if field.is_shared() && !field.is_acquired() {
        let handle = field.surface().map(|s| s.native_handle()).unwrap_or_default();
        return Err(FluidError::ProtocolViolation(format!(
            "surface {} must be acquired before the solver touches it",
            handle
        )));
    }
    Ok(())
}
