//! Runner harness and build contexts for sandbox images.
//!
//! The harness is a small Python script baked into the base image (container
//! backend) or written next to the submission (local backend). The base image
//! tag is derived from a hash of the harness and the base Dockerfile, so a
//! harness change produces a new tag and concurrent calls share one build.

use sha2::{Digest, Sha256};

/// Python runner executed inside every sandbox.
pub const RUNNER_SOURCE: &str = include_str!("harness/runner.py");

pub const RUNNER_FILE: &str = "runner.py";
pub const SUBMISSION_FILE: &str = "submission.py";

/// Path of the submission inside a container unit.
pub const CONTAINER_SUBMISSION_PATH: &str = "/sandbox/submission.py";
/// Writable scratch mount inside a container unit.
pub const CONTAINER_SCRATCH_PATH: &str = "/scratch";

pub const ENV_MODE: &str = "NEXUS_HARNESS_MODE";
pub const ENV_ALLOWED_MODULES: &str = "NEXUS_ALLOWED_MODULES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessMode {
    /// Full builtins, import allow-list enforced.
    Container,
    /// Whitelisted builtins only, import allow-list enforced.
    Restricted,
}

impl HarnessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarnessMode::Container => "container",
            HarnessMode::Restricted => "restricted",
        }
    }
}

/// Environment variables handed to the runner.
pub fn harness_env(mode: HarnessMode, allowed_modules: &[String]) -> Vec<(String, String)> {
    vec![
        (ENV_MODE.to_string(), mode.as_str().to_string()),
        (ENV_ALLOWED_MODULES.to_string(), allowed_modules.join(",")),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
    ]
}

pub fn base_dockerfile(base_image: &str, version: &str) -> String {
    format!(
        "FROM {base_image}\n\
         LABEL io.nexus.harness-version=\"{version}\"\n\
         COPY {runner} /opt/nexus/{runner}\n\
         WORKDIR {scratch}\n\
         ENTRYPOINT [\"python3\", \"-I\", \"/opt/nexus/{runner}\", \"{submission}\"]\n",
        base_image = base_image,
        version = version,
        runner = RUNNER_FILE,
        scratch = CONTAINER_SCRATCH_PATH,
        submission = CONTAINER_SUBMISSION_PATH,
    )
}

pub fn run_dockerfile(base_tag: &str, sandbox_id: &str) -> String {
    format!(
        "FROM {base_tag}\n\
         LABEL io.nexus.sandbox=\"{sandbox_id}\"\n\
         COPY {submission_file} {submission_path}\n",
        base_tag = base_tag,
        sandbox_id = sandbox_id,
        submission_file = SUBMISSION_FILE,
        submission_path = CONTAINER_SUBMISSION_PATH,
    )
}

/// Short content hash of everything that goes into the base image.
pub fn harness_version(base_image: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(RUNNER_SOURCE.as_bytes());
    hasher.update(base_dockerfile(base_image, "").as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

pub fn base_image_tag(prefix: &str, base_image: &str) -> String {
    format!("{}-base:{}", prefix, harness_version(base_image))
}

pub fn run_image_tag(prefix: &str, sandbox_id: &str) -> String {
    format!("{}-run:{}", prefix, sandbox_id)
}

/// Tar context for the cached base image.
pub fn base_context(base_image: &str) -> std::io::Result<Vec<u8>> {
    let version = harness_version(base_image);
    build_tar(&[
        ("Dockerfile", base_dockerfile(base_image, &version).as_bytes()),
        (RUNNER_FILE, RUNNER_SOURCE.as_bytes()),
    ])
}

/// Tar context for the single-use image carrying one submission.
pub fn run_context(base_tag: &str, sandbox_id: &str, source: &str) -> std::io::Result<Vec<u8>> {
    build_tar(&[
        ("Dockerfile", run_dockerfile(base_tag, sandbox_id).as_bytes()),
        (SUBMISSION_FILE, source.as_bytes()),
    ])
}

fn build_tar(entries: &[(&str, &[u8])]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(path)?;
        header.set_size(data.len() as u64);
        header.set_mode(0o444);
        header.set_mtime(0);
        header.set_cksum();
        builder.append(&header, *data)?;
    }
    builder.into_inner()
}
