//! Recording media-type negotiation.
//!
//! The recorder asks a capability collaborator about each entry of an
//! ordered preference list. The first supported entry wins; when none is
//! supported the configured default container is used.

/// Answers whether a recording backend can produce a given media type.
pub trait CapabilityQuery {
    fn is_type_supported(&self, media_type: &str) -> bool;
}

impl<F> CapabilityQuery for F
where
    F: Fn(&str) -> bool,
{
    fn is_type_supported(&self, media_type: &str) -> bool {
        self(media_type)
    }
}

/// Outcome of negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub media_type: String,
    /// True when no preference was supported and the default was used.
    pub fell_back: bool,
}

/// Pick the first supported entry of `preferences`, else `default`.
pub fn negotiate<S: AsRef<str>>(
    preferences: &[S],
    default: &str,
    caps: &dyn CapabilityQuery,
) -> Negotiated {
    for pref in preferences {
        let pref = pref.as_ref();
        if caps.is_type_supported(pref) {
            tracing::debug!(media_type = pref, "negotiated recording type");
            return Negotiated {
                media_type: pref.to_string(),
                fell_back: false,
            };
        }
    }

    tracing::warn!(
        default,
        tried = preferences.len(),
        "no preferred recording type supported; using default"
    );
    Negotiated {
        media_type: default.to_string(),
        fell_back: true,
    }
}
