/// Scheme prefix of canonical channel URIs.
pub(crate) const CHANNEL_URI_PREFIX: &str = "lbry://";

/// Configured channel lists, canonicalized once at construction so that
/// admission predicates compare by exact string equality.
///
/// Canonical form: lower-cased, first `#` replaced by `:`, prefixed with the
/// scheme. `@BretWeinstein#f` and `@bretweinstein:f` both canonicalize to
/// `lbry://@bretweinstein:f`.
#[derive(Debug, Default, Clone)]
pub struct ChannelConfig {
    priority: Vec<String>,
    enabled: Vec<String>,
    disabled: Vec<String>,
}

impl ChannelConfig {
    pub fn new<I, S>(priority: I, enabled: I, disabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let config = Self {
            priority: canonicalize_all(priority),
            enabled: canonicalize_all(enabled),
            disabled: canonicalize_all(disabled),
        };
        tracing::info!(
            priority = config.priority.len(),
            enabled = config.enabled.len(),
            disabled = config.disabled.len(),
            "loaded configured channels"
        );
        config
    }

    pub fn is_priority(&self, channel_uri: &str) -> bool {
        self.priority.iter().any(|c| c == channel_uri)
    }

    pub fn is_enabled(&self, channel_uri: &str) -> bool {
        self.enabled.iter().any(|c| c == channel_uri)
    }

    pub fn is_disabled(&self, channel_uri: &str) -> bool {
        self.disabled.iter().any(|c| c == channel_uri)
    }
}

fn canonicalize_all<I, S>(channels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    channels
        .into_iter()
        .map(|c| format!("{CHANNEL_URI_PREFIX}{}", canonical_channel(c.as_ref())))
        .collect()
}

/// Lower-case and substitute the first `#` claim separator with `:`.
pub(crate) fn canonical_channel(channel: &str) -> String {
    channel.to_lowercase().replacen('#', ":", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form() {
        let config = ChannelConfig::new(
            vec!["@BretWeinstein:f"],
            vec!["@davidpakman#7"],
            vec!["@TheVoiceofReason#a"],
        );

        assert!(config.is_priority("lbry://@bretweinstein:f"));
        assert!(config.is_enabled("lbry://@davidpakman:7"));
        assert!(config.is_disabled("lbry://@thevoiceofreason:a"));

        assert!(!config.is_priority("lbry://@davidpakman:7"));
        assert!(!config.is_enabled("lbry://@BretWeinstein:f"));
    }

    #[test]
    fn only_first_hash_is_substituted() {
        assert_eq!(canonical_channel("@Chan#a#b"), "@chan:a#b");
    }
}
