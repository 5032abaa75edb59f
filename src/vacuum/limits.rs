#![forbid(unsafe_code)]

use serde::Serialize;

use crate::storage::xact::TransactionManager;
use crate::types::Xid;

/// Watermarks fixed at the start of one relation's pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VacuumLimits {
    /// Versions deleted by transactions preceding this id are removable.
    pub oldest_xmin: Xid,
    /// Live versions created before this id get the frozen creator id.
    pub freeze_limit: Xid,
}

/// Outcome of computing limits; `clamped` is set when the freeze cutoff had
/// to be pulled back to the oldest running transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitsOutcome {
    /// Limits to use.
    pub limits: VacuumLimits,
    /// Freeze cutoff was newer than the oldest running transaction.
    pub clamped: bool,
}

/// Computes the watermarks for a pass run by transaction `own_xid`.
pub fn compute_limits(
    xact: &TransactionManager,
    own_xid: Xid,
    freeze: bool,
    freeze_min_age: u32,
) -> LimitsOutcome {
    let oldest_xmin = xact.oldest_xmin(true);
    let mut limit = if freeze {
        oldest_xmin
    } else {
        own_xid.wrapping_back(freeze_min_age)
    };
    if !limit.is_normal() {
        limit = Xid::FIRST_NORMAL;
    }
    let clamped = limit.follows(oldest_xmin);
    if clamped {
        limit = oldest_xmin;
    }
    LimitsOutcome {
        limits: VacuumLimits {
            oldest_xmin,
            freeze_limit: limit,
        },
        clamped,
    }
}
