// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Per spec §7, every anomaly a SWI implementation can hit is either a
//! [`UsageError`] -- recoverable, reported back to the caller as an
//! [`ErrorBlock`] with V set -- or a [`FaultInfo`], severe enough that the
//! kernel never returns to the offending task at all. This module is the
//! `?`-friendly glue between SWI bodies (which return `Result<_, UserError>`)
//! and the dispatcher in `crate::swi`, which is the only place that decides
//! what each variant means for the caller's registers.

use abi::{ErrorBlock, FaultInfo, UsageError};

/// The error type threaded through SWI implementations via `?`.
#[derive(Clone, Copy, Debug)]
pub enum UserError {
    /// A recoverable usage error: the dispatcher reports it to the caller
    /// rather than killing anything.
    Recoverable(UsageError),
    /// A fault severe enough that the kernel tears the caller down instead
    /// of returning to it (spec §7's "all other anomalies are panics" does
    /// *not* apply here -- a `FaultInfo` is the one kind of severe error
    /// that's still scoped to a single task rather than the whole core).
    Unrecoverable(FaultInfo),
}

impl From<UsageError> for UserError {
    fn from(e: UsageError) -> Self {
        UserError::Recoverable(e)
    }
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        UserError::Unrecoverable(f)
    }
}

/// Whether a SWI was issued in its `X`-form (error returned in-band, V set)
/// or its plain form (error converted into the legacy `GenerateError`
/// signal before the caller resumes), per spec §7's propagation policy.
/// `crate::swi::Dispatch` carries this alongside the decoded SWI number.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorForm {
    XForm,
    Generated,
}

/// Renders a [`UsageError`] as the wire-level [`ErrorBlock`] a SWI return
/// path writes into the caller's registers. Both forms carry the same
/// block; only the convention for what the caller does with V differs, and
/// that's `crate::swi`'s concern, not this function's.
pub fn render(err: UsageError, _form: ErrorForm) -> ErrorBlock {
    ErrorBlock::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_preserves_error_code() {
        let block = render(UsageError::PipeFull, ErrorForm::XForm);
        assert_eq!(block.code, UsageError::PipeFull.code());
    }

    #[test]
    fn usage_error_converts_to_recoverable() {
        let e: UserError = UsageError::BadHandle.into();
        assert!(matches!(e, UserError::Recoverable(UsageError::BadHandle)));
    }
}
