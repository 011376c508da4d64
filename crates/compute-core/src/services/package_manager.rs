use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, Result};
use crate::models::{AssemblyDistribution, ComputeConfiguration, PackageDescriptor};

use super::discovery::{self, PackageDiscovery};
use super::events::ValidPackageFound;
use super::package_reader::DESCRIPTOR_FILENAME;

/// Finds a valid package and replicates its assembly into per-port staging directories.
pub struct PackageManager {
    package_folder: PathBuf,
    staging_root: PathBuf,
    discovery: Box<dyn PackageDiscovery>,
    package_found: Option<ValidPackageFound>,
}

impl PackageManager {
    pub fn new(config: &ComputeConfiguration) -> Self {
        let discovery = discovery::for_mode(
            config.discovery,
            config.package_folder.join(DESCRIPTOR_FILENAME),
            config.polling_interval(),
        );
        Self::with_discovery(
            config.package_folder.clone(),
            config.staging_root.clone(),
            discovery,
        )
    }

    pub fn with_discovery(
        package_folder: PathBuf,
        staging_root: PathBuf,
        discovery: Box<dyn PackageDiscovery>,
    ) -> Self {
        Self {
            package_folder,
            staging_root,
            discovery,
            package_found: None,
        }
    }

    /// Publish every discovered package to `notifier`.
    pub fn with_package_notifier(mut self, notifier: ValidPackageFound) -> Self {
        self.package_found = Some(notifier);
        self
    }

    /// Block until a valid package descriptor is found or `cancel` fires.
    pub async fn periodically_check_for_valid_package(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<PackageDescriptor> {
        tracing::info!(folder = %self.package_folder.display(), "waiting for a valid package");
        let package = self.discovery.next_package(cancel).await?;
        tracing::info!(
            instances = package.number_of_instances,
            assembly = %package.assembly_name,
            "valid package found"
        );
        if let Some(notifier) = &self.package_found {
            if let Err(e) = notifier.publish(package.clone()).await {
                tracing::warn!(error = %e, "could not publish package notification");
            }
        }
        Ok(package)
    }

    /// Copy the package assembly to as many of `available_ports` as the package asks for.
    ///
    /// A fleet smaller than the requested instance count is not an error: every
    /// available port receives a copy.
    pub async fn distribute(
        &self,
        package: &PackageDescriptor,
        available_ports: &[u16],
    ) -> Result<Vec<AssemblyDistribution>> {
        let targets = select_targets(available_ports, package.number_of_instances);
        if targets.len() < package.number_of_instances {
            tracing::warn!(
                requested = package.number_of_instances,
                available = targets.len(),
                "fewer containers than requested instances, using all available"
            );
        }
        let source = self.package_folder.join(&package.assembly_name);
        self.copy_assemblies(&source, &self.package_folder, targets)
            .await
    }

    /// Copy `source_assembly_path`, plus the other files in `source_folder`,
    /// into the staging directory of each port in `target_ports`, in order.
    ///
    /// All-or-nothing: on any failure every file copied and every staging
    /// directory created by this call is removed. Directories that already
    /// existed are left in place.
    pub async fn copy_assemblies(
        &self,
        source_assembly_path: &Path,
        source_folder: &Path,
        target_ports: &[u16],
    ) -> Result<Vec<AssemblyDistribution>> {
        let mut staged = Staged::default();
        match self
            .copy_all(source_assembly_path, source_folder, target_ports, &mut staged)
            .await
        {
            Ok(distributions) => {
                tracing::info!(count = distributions.len(), "assemblies staged");
                Ok(distributions)
            }
            Err(e) => {
                tracing::error!(error = %e, "distribution failed, removing staged copies");
                staged.roll_back().await;
                Err(e)
            }
        }
    }

    async fn copy_all(
        &self,
        source_assembly_path: &Path,
        source_folder: &Path,
        target_ports: &[u16],
        staged: &mut Staged,
    ) -> Result<Vec<AssemblyDistribution>> {
        let Some(first_port) = target_ports.first().copied() else {
            return Ok(Vec::new());
        };
        let file_name = source_assembly_path
            .file_name()
            .ok_or_else(|| ComputeError::Distribution {
                port: first_port,
                message: format!("{} does not name a file", source_assembly_path.display()),
            })?
            .to_owned();
        if !tokio::fs::metadata(source_assembly_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Err(ComputeError::Distribution {
                port: first_port,
                message: format!("assembly {} not found", source_assembly_path.display()),
            });
        }

        let dependencies = sibling_files(source_folder, source_assembly_path)
            .await
            .map_err(|e| ComputeError::Distribution {
                port: first_port,
                message: format!("cannot list {}: {e}", source_folder.display()),
            })?;

        let mut distributions = Vec::with_capacity(target_ports.len());
        for &port in target_ports {
            let staging_dir = self.staging_root.join(port.to_string());
            let distribution_error = |message: String| ComputeError::Distribution { port, message };

            let existed = tokio::fs::try_exists(&staging_dir).await.unwrap_or(false);
            tokio::fs::create_dir_all(&staging_dir)
                .await
                .map_err(|e| distribution_error(format!("create {}: {e}", staging_dir.display())))?;
            if !existed {
                staged.dirs.push(staging_dir.clone());
            }

            let destination = staging_dir.join(&file_name);
            copy_file(source_assembly_path, &destination, &mut staged.files)
                .await
                .map_err(|e| distribution_error(e.to_string()))?;

            for dependency in &dependencies {
                if let Some(name) = dependency.file_name() {
                    copy_file(dependency, &staging_dir.join(name), &mut staged.files)
                        .await
                        .map_err(|e| distribution_error(e.to_string()))?;
                }
            }

            tracing::debug!(port, destination = %destination.display(), "assembly staged");
            distributions.push(AssemblyDistribution {
                source_path: source_assembly_path.to_path_buf(),
                destination_path: destination,
                port,
            });
        }
        Ok(distributions)
    }

    /// Remove the staging directories behind `distributions`.
    pub async fn release_staging(&self, distributions: &[AssemblyDistribution]) -> Result<()> {
        let dirs: Vec<PathBuf> = distributions
            .iter()
            .filter_map(|d| d.staging_dir().map(Path::to_path_buf))
            .collect();
        self.release_staging_dirs(&dirs).await
    }

    /// Remove `dirs` recursively. Directories that are already gone are skipped.
    pub async fn release_staging_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        let mut failures = Vec::new();
        for dir in dirs {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => tracing::debug!(path = %dir.display(), "staging dir released"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "could not release staging dir");
                    failures.push(format!("{}: {e}", dir.display()));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ComputeError::Shutdown(failures.join("; ")))
        }
    }
}

/// What one `copy_assemblies` call has put on disk so far.
#[derive(Default)]
struct Staged {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl Staged {
    async fn roll_back(self) {
        for path in self.files.iter().rev() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "could not remove staged file");
            }
        }
        for dir in self.dirs.iter().rev() {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                tracing::warn!(path = %dir.display(), error = %e, "could not remove staging dir");
            }
        }
    }
}

/// First `requested` ports, or all of them when fewer are available.
pub fn select_targets(available_ports: &[u16], requested: usize) -> &[u16] {
    &available_ports[..requested.min(available_ports.len())]
}

async fn copy_file(from: &Path, to: &Path, copied: &mut Vec<PathBuf>) -> std::io::Result<()> {
    tokio::fs::copy(from, to).await.map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("copy {} -> {}: {e}", from.display(), to.display()),
        )
    })?;
    copied.push(to.to_path_buf());
    Ok(())
}

/// Regular files next to the assembly, excluding the assembly and the descriptor.
async fn sibling_files(folder: &Path, assembly: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if path == assembly || path.file_name() == Some(OsStr::new(DESCRIPTOR_FILENAME)) {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}
