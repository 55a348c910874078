use thiserror::Error;

/// Custom program error code the pool program returns when a position
/// account still holds liquidity at close time (6030 / 0x178e).
pub const NON_EMPTY_POSITION_CODE: u32 = 6030;

/// Market data vendor error classification
#[derive(Error, Debug, Clone)]
pub enum VendorError {
    /// HTTP 429 from the vendor. Surfaced distinctly so callers can serve
    /// stale or neutral fallback data and the boundary can emit 429.
    #[error("vendor rate limit exceeded")]
    RateLimited,

    #[error("vendor HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("vendor network error: {0}")]
    Network(String),

    #[error("vendor response parse error: {0}")]
    Parse(String),
}

impl VendorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VendorError::Network(_)) || matches!(self, VendorError::Http { status, .. } if *status >= 500)
    }
}

/// RPC / on-chain error classification
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// RPC node rate limit (429)
    #[error("rpc rate limit exceeded")]
    RateLimited,

    /// Network faults and 5xx responses, retriable with backoff
    #[error("transient rpc error: {0}")]
    Transient(String),

    /// The attached blockhash expired before confirmation
    #[error("blockhash expired: {0}")]
    BlockhashExpired(String),

    /// Confirmation did not arrive within the submission timeout
    #[error("transaction confirmation timed out after {0} ms")]
    ConfirmationTimeout(u64),

    /// Pool rejected the deposit because the active bin moved too far
    #[error("bin slippage tolerance exceeded")]
    SlippageExceeded,

    /// Position account still holds liquidity (program error 6030 / 0x178e)
    #[error("position account not empty")]
    NonEmptyPosition,

    /// Account targeted by the operation does not exist
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// Rejected before reaching the chain
    #[error("validation error: {0}")]
    Validation(String),

    /// Anything the retry machinery must not touch
    #[error("chain error: {0}")]
    Fatal(String),
}

impl ChainError {
    /// Worth retrying a serialized read with backoff
    pub fn is_retriable_read(&self) -> bool {
        matches!(self, ChainError::RateLimited | ChainError::Transient(_))
    }

    /// Worth retrying a submission with a fresh blockhash
    pub fn is_retriable_submit(&self) -> bool {
        matches!(
            self,
            ChainError::BlockhashExpired(_)
                | ChainError::ConfirmationTimeout(_)
                | ChainError::Transient(_)
                | ChainError::RateLimited
        )
    }

    /// Classify a raw RPC client error by its message
    pub fn classify(message: &str) -> ChainError {
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("too many requests") {
            ChainError::RateLimited
        } else if lower.contains("blockhash not found") {
            ChainError::BlockhashExpired(message.to_string())
        } else if lower.contains("block height exceeded") {
            ChainError::BlockhashExpired(message.to_string())
        } else if lower.contains("exceededbinslippagetolerance") {
            ChainError::SlippageExceeded
        } else if lower.contains("0x178e") || lower.contains("custom program error: 6030") {
            ChainError::NonEmptyPosition
        } else if lower.contains("accountnotfound") || lower.contains("account not found") {
            ChainError::AccountNotFound(message.to_string())
        } else if lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("io error")
            || lower.contains("502")
            || lower.contains("503")
        {
            ChainError::Transient(message.to_string())
        } else {
            ChainError::Fatal(message.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert!(matches!(
            ChainError::classify("HTTP status client error (429 Too Many Requests)"),
            ChainError::RateLimited
        ));
    }

    #[test]
    fn test_classify_blockhash() {
        assert!(matches!(
            ChainError::classify("Transaction simulation failed: Blockhash not found"),
            ChainError::BlockhashExpired(_)
        ));
        assert!(matches!(
            ChainError::classify("transaction expired: block height exceeded"),
            ChainError::BlockhashExpired(_)
        ));
    }

    #[test]
    fn test_classify_slippage() {
        let e = ChainError::classify(
            "Error processing Instruction 2: custom program error: ExceededBinSlippageTolerance",
        );
        assert!(matches!(e, ChainError::SlippageExceeded));
    }

    #[test]
    fn test_classify_non_empty_position() {
        assert!(matches!(
            ChainError::classify("custom program error: 0x178e"),
            ChainError::NonEmptyPosition
        ));
        assert!(matches!(
            ChainError::classify("custom program error: 6030"),
            ChainError::NonEmptyPosition
        ));
    }

    #[test]
    fn test_submit_retriability() {
        assert!(ChainError::BlockhashExpired("x".into()).is_retriable_submit());
        assert!(ChainError::ConfirmationTimeout(180_000).is_retriable_submit());
        assert!(!ChainError::SlippageExceeded.is_retriable_submit());
        assert!(!ChainError::Fatal("boom".into()).is_retriable_submit());
    }

    #[test]
    fn test_vendor_transient() {
        assert!(VendorError::Network("reset".into()).is_transient());
        assert!(VendorError::Http {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!VendorError::RateLimited.is_transient());
        assert!(!VendorError::Http {
            status: 404,
            message: "nope".into()
        }
        .is_transient());
    }
}
