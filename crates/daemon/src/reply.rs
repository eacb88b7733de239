//! Reply-code taxonomy used towards the operator: every transfer outcome
//! collapses into one of the command-channel codes.

use chain::ChainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Success = 0,
    Error = 4,
    Busy = 6,
    Syntax = 8,
}

impl ReplyCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Map a chain-control error onto the reply taxonomy.
pub fn classify_chain(err: &ChainError) -> ReplyCode {
    match err {
        ChainError::AlreadyRunning => ReplyCode::Busy,
        ChainError::DuplicateProducer
        | ChainError::NoProducer
        | ChainError::Closed
        | ChainError::NotClosed
        | ChainError::TypeMismatch { .. } => ReplyCode::Syntax,
        _ => ReplyCode::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_when_already_running() {
        assert_eq!(classify_chain(&ChainError::AlreadyRunning), ReplyCode::Busy);
        assert_eq!(ReplyCode::Busy.code(), 6);
    }

    #[test]
    fn build_errors_are_syntax() {
        assert_eq!(classify_chain(&ChainError::NoProducer), ReplyCode::Syntax);
        assert_eq!(ReplyCode::Syntax.code(), 8);
    }

    #[test]
    fn runtime_errors_are_plain_errors() {
        assert_eq!(
            classify_chain(&ChainError::NotRunning),
            ReplyCode::Error
        );
    }
}
