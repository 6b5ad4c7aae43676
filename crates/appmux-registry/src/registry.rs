use appmux_core::{ActivationOverride, ChainHeight, MultiplexerError, Result};

use crate::VersionDescriptor;

/// Ordered, validated set of embedded application versions. Read-only once
/// built.
#[derive(Debug)]
pub struct VersionRegistry {
    descriptors: Vec<VersionDescriptor>,
}

impl VersionRegistry {
    pub fn new(descriptors: Vec<VersionDescriptor>) -> Result<Self> {
        Self::with_override(descriptors, None)
    }

    /// Builds a registry after shifting one version's activation height.
    ///
    /// The override is applied before validation, so an override that breaks
    /// height ordering fails the same way a bad static list does.
    pub fn with_override(
        mut descriptors: Vec<VersionDescriptor>,
        activation_override: Option<ActivationOverride>,
    ) -> Result<Self> {
        if let Some(activation_override) = activation_override {
            let target = descriptors
                .iter_mut()
                .find(|descriptor| descriptor.app_version() == activation_override.app_version)
                .ok_or(MultiplexerError::UnknownVersion(
                    activation_override.app_version,
                ))?;
            target.set_activation_height(activation_override.height);
        }

        validate(&descriptors)?;
        Ok(Self { descriptors })
    }

    /// Version that should be running at `height`: the greatest app version
    /// whose activation height is at or below it.
    pub fn resolve_for_height(&self, height: ChainHeight) -> Result<&VersionDescriptor> {
        self.descriptors
            .iter()
            .rev()
            .find(|descriptor| descriptor.is_active_at(height))
            .ok_or(MultiplexerError::NoActiveVersion { height })
    }

    pub fn next(&self, current: &VersionDescriptor) -> Option<&VersionDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.app_version() > current.app_version())
    }

    pub fn by_app_version(&self, app_version: u64) -> Result<&VersionDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.app_version() == app_version)
            .ok_or(MultiplexerError::UnknownVersion(app_version))
    }

    pub fn first(&self) -> &VersionDescriptor {
        &self.descriptors[0]
    }

    pub fn latest(&self) -> &VersionDescriptor {
        &self.descriptors[self.descriptors.len() - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn validate(descriptors: &[VersionDescriptor]) -> Result<()> {
    let invalid = |reason: String| Err(MultiplexerError::InvalidRegistry(reason));

    let Some(first) = descriptors.first() else {
        return invalid("at least one app version is required".to_string());
    };
    if first.app_version() == 0 {
        return invalid("app version 0 is reserved".to_string());
    }

    for pair in descriptors.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.app_version() <= prev.app_version() {
            return invalid(format!(
                "app versions must be strictly increasing: {} is listed after {}",
                next.app_version(),
                prev.app_version()
            ));
        }
        if next.abci_version() < prev.abci_version() {
            return invalid(format!(
                "app version {} regresses to abci {} after {} used abci {}",
                next.app_version(),
                next.abci_version(),
                prev.app_version(),
                prev.abci_version()
            ));
        }

        let Some(next_height) = next.activation_height() else {
            return invalid(format!(
                "app version {} needs an activation height",
                next.app_version()
            ));
        };
        match prev.activation_height() {
            None if next_height == 0 => {
                return invalid(format!(
                    "app version {} cannot activate at height 0 after an unbounded app version {}",
                    next.app_version(),
                    prev.app_version()
                ));
            }
            None => {}
            Some(prev_height) if next_height <= prev_height => {
                return invalid(format!(
                    "activation heights must be strictly increasing: app version {} at {} is not after app version {} at {}",
                    next.app_version(),
                    next_height,
                    prev.app_version(),
                    prev_height
                ));
            }
            Some(_) => {}
        }
    }

    Ok(())
}
