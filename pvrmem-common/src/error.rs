// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Broad failure class shared by every allocator and tracker error.
///
/// Higher layers decide how to recover from the class alone: exhaustion means
/// "kick or evict, then retry", a timeout means the GPU is behind, and a
/// contract violation is a caller bug that must not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// No space, block or slot was available and growth failed.
    Exhausted,
    /// The consumer has not caught up within the bounded wait.
    Timeout,
    /// The caller broke an API contract.
    ContractViolation,
}

impl ErrorClass {
    /// Whether retrying later (after a kick or an eviction) can succeed.
    #[inline]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::ContractViolation)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "exhausted"),
            Self::Timeout => write!(f, "timeout"),
            Self::ContractViolation => write!(f, "contract violation"),
        }
    }
}

/// Implemented by every error type in the workspace.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
