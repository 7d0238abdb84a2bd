//! Self-update: atomically replace the tool binary from the update
//! registry.
//!
//! Release selection is a two-stage filter: semantic versions strictly
//! below the current one are dropped (equality survives to the next
//! stage), then anything whose build time is not strictly newer goes.
//! The two stages are deliberately separate so a same-version rebuild
//! with a later build stamp is still an update.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use semver::Version;

use dcadm_config::Config;
use dcadm_types::{Image, lenient_semver};

use crate::Reporter;
use crate::api::ImgapiClient;

/// Image name of the tool itself in the update registry.
pub const TOOL_IMAGE_NAME: &str = "dcadm";

pub const INSTALLER_FILE: &str = "install-dcadm.sh";
pub const INSTALL_LOG: &str = "install.log";

/// A parsed `<branch>-<buildtime>-g<commit>` build stamp. Branch names may
/// themselves contain hyphens, so parsing works from the right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStamp {
    pub branch: String,
    pub build_time: String,
    pub commit: String,
}

impl BuildStamp {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (rest, commit) = raw
            .rsplit_once('-')
            .filter(|(_, c)| c.starts_with('g') && c.len() > 1)
            .with_context(|| format!("build stamp has no -g<commit> suffix: {raw:?}"))?;
        let (branch, build_time) = rest
            .rsplit_once('-')
            .filter(|(_, t)| looks_like_time(t))
            .with_context(|| format!("build stamp has no timestamp segment: {raw:?}"))?;
        Ok(Self {
            branch: branch.to_string(),
            build_time: build_time.to_string(),
            commit: commit.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read build stamp {}", path.display()))?;
        Self::parse(&content)
    }
}

fn looks_like_time(s: &str) -> bool {
    s.len() == 16
        && s.ends_with('Z')
        && s.as_bytes()[8] == b'T'
        && s.chars()
            .enumerate()
            .all(|(i, c)| matches!(i, 8 | 15) || c.is_ascii_digit())
}

/// The running tool's identity.
#[derive(Debug, Clone)]
pub struct CurrentBuild {
    pub version: Version,
    pub stamp: BuildStamp,
}

impl CurrentBuild {
    /// Version from the crate, stamp from the file shipped next to the
    /// binary.
    pub fn detect(stamp_path: &Path) -> Result<Self> {
        Ok(Self {
            version: Version::parse(env!("CARGO_PKG_VERSION"))
                .context("crate version is not semver")?,
            stamp: BuildStamp::from_file(stamp_path)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelfUpdateOptions {
    pub allow_major_update: bool,
    pub dry_run: bool,
}

/// The two-stage release filter. Returns survivors sorted ascending by
/// `(version, build time)`; the last entry is the one to install.
pub fn filter_releases(
    releases: Vec<Image>,
    current: &CurrentBuild,
    allow_major_update: bool,
) -> Vec<Image> {
    let mut kept: Vec<Image> = releases
        .into_iter()
        .filter(|release| {
            let version = lenient_semver(&release.version);
            if version < current.version {
                return false;
            }
            if !allow_major_update && version.major != current.version.major {
                return false;
            }
            true
        })
        .filter(|release| match release.build_time() {
            Some(build_time) => build_time > current.stamp.build_time.as_str(),
            None => false,
        })
        .collect();

    kept.sort_by(|a, b| {
        (lenient_semver(&a.version), a.build_time().unwrap_or_default())
            .cmp(&(lenient_semver(&b.version), b.build_time().unwrap_or_default()))
    });
    kept
}

/// Locate, download, and run the installer for the newest eligible
/// release.
pub fn self_update(
    updates: &ImgapiClient,
    config: &Config,
    current: &CurrentBuild,
    reporter: &mut dyn Reporter,
    opts: &SelfUpdateOptions,
) -> Result<()> {
    let releases = updates.list_images(TOOL_IMAGE_NAME, None)?;
    let eligible = filter_releases(releases, current, opts.allow_major_update);

    let Some(release) = eligible.last() else {
        reporter.info(&format!(
            "No available {TOOL_IMAGE_NAME} updates (current {} {})",
            current.version, current.stamp.build_time
        ));
        return Ok(());
    };

    reporter.info(&format!(
        "updating {TOOL_IMAGE_NAME} {} ({}) -> {} ({})",
        current.version,
        current.stamp.build_time,
        release.version,
        release.build_time().unwrap_or("unknown")
    ));

    if opts.dry_run {
        reporter.info(&format!("[dry-run] download installer {}", release.uuid));
        reporter.info("[dry-run] run installer");
        return Ok(());
    }

    let workdir = workdir_for_now(config);
    fs::create_dir_all(&workdir)
        .with_context(|| format!("failed to create work dir {}", workdir.display()))?;

    let installer = workdir.join(INSTALLER_FILE);
    updates.download_file(release.uuid, &installer)?;
    make_executable(&installer)?;

    let log_path = workdir.join(INSTALL_LOG);
    run_installer(&installer, &log_path)?;

    reporter.info(&format!(
        "updated to {} ({}); installer log at {}",
        release.version,
        release.build_time().unwrap_or("unknown"),
        log_path.display()
    ));
    Ok(())
}

fn workdir_for_now(config: &Config) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    config.state_dir.join("updates").join(stamp)
}

fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod {}", path.display()))
}

/// Run the installer with its output captured to the install log; surface
/// failure verbatim.
fn run_installer(installer: &Path, log_path: &Path) -> Result<()> {
    let log = fs::File::create(log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let log_err = log
        .try_clone()
        .context("failed to clone install log handle")?;

    let status = Command::new(installer)
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .status()
        .with_context(|| format!("failed to run installer {}", installer.display()))?;

    if !status.success() {
        let tail = fs::read_to_string(log_path).unwrap_or_default();
        bail!(
            "installer exited with {}: {}",
            status,
            tail.lines().next_back().unwrap_or("(no output)")
        );
    }
    Ok(())
}
