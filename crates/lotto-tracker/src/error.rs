#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("a download needs a movie id or a lottery id")]
    MissingIdentity,
    #[error("{action} rejected: {message}")]
    Rejected {
        action: &'static str,
        message: String,
    },
    #[error("{action} failed: {message}")]
    Transport {
        action: &'static str,
        message: String,
    },
}

impl TrackerError {
    pub(crate) fn transport(action: &'static str, err: &anyhow::Error) -> Self {
        TrackerError::Transport {
            action,
            message: format_error_chain(err),
        }
    }
}

/// Joins an error and its causes with `": "`, skipping empty and repeated
/// messages.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
