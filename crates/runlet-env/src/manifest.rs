//! Rendering of declared dependencies into the requirements manifest.

use runlet_store::Dependency;
use tracing::warn;

const SPEC_PREFIXES: [&str; 6] = ["==", ">=", "<=", "~=", ">", "<"];

/// One requirement line per dependency:
/// - empty or `*` constraint: bare package name (latest),
/// - a recognized comparison prefix: `name<spec>`,
/// - anything else: bare package name. Unrecognized constraints silently
///   meant "latest" in the installer; keep that but make it visible.
pub fn render_manifest(dependencies: &[Dependency]) -> String {
    let mut manifest = String::new();
    for dependency in dependencies {
        manifest.push_str(&requirement_line(dependency));
        manifest.push('\n');
    }
    manifest
}

fn requirement_line(dependency: &Dependency) -> String {
    let spec = dependency.version_spec.trim();
    if spec.is_empty() || spec == "*" {
        return dependency.package_name.clone();
    }
    if SPEC_PREFIXES.iter().any(|prefix| spec.starts_with(prefix)) {
        return format!("{}{}", dependency.package_name, spec);
    }
    warn!(
        package = %dependency.package_name,
        spec,
        "unrecognized version constraint, installing latest"
    );
    dependency.package_name.clone()
}
