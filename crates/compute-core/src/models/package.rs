use std::path::PathBuf;

/// Parsed package descriptor. Only constructed once both fields validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub number_of_instances: usize,
    pub assembly_name: String,
}

/// One staged copy of the package assembly, bound to the container on `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyDistribution {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub port: u16,
}

impl AssemblyDistribution {
    /// The per-port staging directory holding `destination_path`.
    pub fn staging_dir(&self) -> Option<&std::path::Path> {
        self.destination_path.parent()
    }
}
