use anyhow::{bail, Result};
use idlewatch_providers::FleetProvider;
use std::sync::Arc;

use crate::settings::{ProviderKind, Settings};

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name(settings: &Settings) -> &'static str {
        match settings.provider {
            ProviderKind::Ec2 => "ec2",
            ProviderKind::Mock => "mock",
        }
    }

    /// Build the provider selected in `settings`. Implementations are behind
    /// cargo features; asking for one that was not compiled in is an error.
    pub fn get_provider(settings: &Settings) -> Result<Arc<dyn FleetProvider>> {
        match settings.provider {
            ProviderKind::Ec2 => Self::ec2(settings),
            ProviderKind::Mock => Self::mock(settings),
        }
    }

    #[cfg(feature = "provider-ec2")]
    fn ec2(settings: &Settings) -> Result<Arc<dyn FleetProvider>> {
        use anyhow::Context;
        use idlewatch_providers::ec2::{AwsSecrets, Ec2Provider};

        // Prefer a secrets file (Docker/K8s friendly), fallback to the default AWS chain.
        let secrets = match settings.aws_secrets_file.as_ref() {
            Some(path) => Some(
                AwsSecrets::from_file(path)
                    .with_context(|| format!("load AWS secrets from {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Arc::new(Ec2Provider::new(secrets)))
    }

    #[cfg(not(feature = "provider-ec2"))]
    fn ec2(_settings: &Settings) -> Result<Arc<dyn FleetProvider>> {
        bail!("provider 'ec2' is not compiled in (enable the provider-ec2 feature)")
    }

    #[cfg(feature = "provider-mock")]
    fn mock(settings: &Settings) -> Result<Arc<dyn FleetProvider>> {
        use idlewatch_providers::mock::MockProvider;

        let Some(path) = settings.mock_fleet_file.as_ref() else {
            bail!("IDLEWATCH_MOCK_FLEET_FILE must be set for the mock provider");
        };
        Ok(Arc::new(MockProvider::from_file(path)?))
    }

    #[cfg(not(feature = "provider-mock"))]
    fn mock(_settings: &Settings) -> Result<Arc<dyn FleetProvider>> {
        bail!("provider 'mock' is not compiled in (enable the provider-mock feature)")
    }
}
