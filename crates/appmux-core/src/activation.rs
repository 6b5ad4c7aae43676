use crate::error::MultiplexerError;

/// Operator-supplied shift of one version's activation boundary.
///
/// Written as `<app_version>=<height>`, for example `3=2371495`. A leading `v`
/// on the version is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationOverride {
    pub app_version: u64,
    pub height: u64,
}

impl ActivationOverride {
    pub fn parse(input: &str) -> Result<Self, MultiplexerError> {
        let invalid = |reason: &str| MultiplexerError::InvalidActivationOverride {
            value: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("value must not be empty"));
        }

        let Some((version, height)) = trimmed.split_once('=') else {
            return Err(invalid("expected <app_version>=<height>"));
        };

        let version = version.trim();
        let version = version.strip_prefix('v').unwrap_or(version);
        let app_version = version
            .parse::<u64>()
            .map_err(|_| invalid("app version must be an unsigned integer"))?;
        let height = height
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("height must be an unsigned integer"))?;
        if height == 0 {
            return Err(invalid("height must be greater than zero"));
        }

        Ok(Self {
            app_version,
            height,
        })
    }

    /// Parses an optional raw value, treating blank input as absent.
    pub fn parse_optional(input: Option<&str>) -> Result<Option<Self>, MultiplexerError> {
        match input {
            Some(value) if !value.trim().is_empty() => Self::parse(value).map(Some),
            _ => Ok(None),
        }
    }
}
