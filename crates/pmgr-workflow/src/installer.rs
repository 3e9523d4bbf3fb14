//! Completion detection for installs handed to an external installer.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{inspect::PackageInspector, model::PackageInfo};

/// A pending external install is abandoned after this long.
pub const EXTERNAL_INSTALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const EXTERNAL_INSTALL_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    Installed(PackageInfo),
    TimedOut,
}

/// Installed state of the package when the watch started.
#[derive(Debug, Clone, PartialEq)]
enum Baseline {
    NotInstalled,
    Installed {
        version_code: Option<i64>,
        last_update: Option<String>,
    },
    /// The package could not be read; the first successful poll becomes
    /// the baseline.
    Unknown,
}

impl Baseline {
    fn of(current: Option<&PackageInfo>) -> Self {
        match current {
            None => Baseline::NotInstalled,
            Some(info) => Baseline::Installed {
                version_code: info.version_code,
                last_update: info.last_update.clone(),
            },
        }
    }
}

/// Watches one package for the change an external installer makes.
pub struct ExternalInstallWatch {
    inspector: Arc<dyn PackageInspector>,
    package_name: String,
    baseline: Baseline,
}

impl ExternalInstallWatch {
    pub async fn begin(inspector: Arc<dyn PackageInspector>, package_name: &str) -> Self {
        let baseline = match inspector.inspect_installed(package_name).await {
            Ok(info) => Baseline::of(info.as_ref()),
            Err(err) => {
                warn!("could not read {package_name} before install: {err}");
                Baseline::Unknown
            }
        };
        debug!("watching {package_name}, baseline {baseline:?}");
        Self {
            inspector,
            package_name: package_name.to_string(),
            baseline,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn is_updated(&self, current: Option<&PackageInfo>) -> bool {
        match (&self.baseline, current) {
            (_, None) | (Baseline::Unknown, _) => false,
            (Baseline::NotInstalled, Some(_)) => true,
            (
                Baseline::Installed {
                    version_code,
                    last_update,
                },
                Some(current),
            ) => current.version_code != *version_code || current.last_update != *last_update,
        }
    }

    pub async fn wait(mut self, timeout: Duration, poll: Duration) -> InstallOutcome {
        let watch = async {
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                match self.inspector.inspect_installed(&self.package_name).await {
                    Ok(current) if self.baseline == Baseline::Unknown => {
                        debug!("baseline of {} read late", self.package_name);
                        self.baseline = Baseline::of(current.as_ref());
                    }
                    Ok(current) if self.is_updated(current.as_ref()) => {
                        if let Some(info) = current {
                            return info;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => debug!("install poll for {}: {err}", self.package_name),
                }
            }
        };
        let outcome = tokio::time::timeout(timeout, watch).await;
        match outcome {
            Ok(info) => {
                info!("external install of {} finished", self.package_name);
                InstallOutcome::Installed(info)
            }
            Err(_) => {
                warn!("external install of {} timed out", self.package_name);
                InstallOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{package_info, FakeInspector};

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn fresh_install_is_detected() {
        let inspector = Arc::new(FakeInspector::default());
        let watch = ExternalInstallWatch::begin(inspector.clone(), "com.example").await;
        assert!(!watch.is_updated(None));

        let later = inspector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            later.set_installed("com.example", Some(package_info("com.example", "1.0")));
        });
        let outcome = watch.wait(Duration::from_secs(5), POLL).await;
        assert!(matches!(outcome, InstallOutcome::Installed(info) if info.package_name == "com.example"));
    }

    #[tokio::test]
    async fn update_needs_a_changed_version_code_or_timestamp() {
        let inspector = Arc::new(FakeInspector::default());
        let mut before = package_info("com.example", "1.0");
        before.version_code = Some(10);
        before.last_update = Some("2024-05-01 10:00:00".into());
        inspector.set_installed("com.example", Some(before.clone()));

        let watch = ExternalInstallWatch::begin(inspector.clone(), "com.example").await;
        assert!(!watch.is_updated(Some(&before)));

        let mut touched = before.clone();
        touched.last_update = Some("2024-05-01 10:05:00".into());
        assert!(watch.is_updated(Some(&touched)));

        let mut bumped = before.clone();
        bumped.version_code = Some(11);
        assert!(watch.is_updated(Some(&bumped)));
    }

    #[tokio::test]
    async fn unchanged_package_times_out() {
        let inspector = Arc::new(FakeInspector::default());
        inspector.set_installed("com.example", Some(package_info("com.example", "1.0")));
        let watch = ExternalInstallWatch::begin(inspector, "com.example").await;
        assert_eq!(
            watch.wait(Duration::from_millis(100), POLL).await,
            InstallOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn unreadable_baseline_needs_a_later_change() {
        let inspector = Arc::new(FakeInspector::default());
        let mut before = package_info("com.example", "1.0");
        before.version_code = Some(10);
        inspector.set_installed("com.example", Some(before.clone()));

        inspector.fail_installed_reads(1);
        let watch = ExternalInstallWatch::begin(inspector.clone(), "com.example").await;
        assert!(!watch.is_updated(Some(&before)));
        assert_eq!(
            watch.wait(Duration::from_millis(100), POLL).await,
            InstallOutcome::TimedOut
        );

        inspector.fail_installed_reads(1);
        let watch = ExternalInstallWatch::begin(inspector.clone(), "com.example").await;
        let later = inspector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut bumped = before;
            bumped.version_code = Some(11);
            later.set_installed("com.example", Some(bumped));
        });
        let outcome = watch.wait(Duration::from_secs(5), POLL).await;
        assert!(matches!(outcome, InstallOutcome::Installed(info) if info.version_code == Some(11)));
    }
}
