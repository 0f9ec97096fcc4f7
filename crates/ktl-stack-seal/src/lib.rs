//! Sealed plan bundles.
//!
//! A sealed plan is a self-contained directory (`plan.json`,
//! `inputs.tar.gz`, `attestation.json`, optional `signature.json`) that is
//! sufficient to reproduce a byte-identical run elsewhere. The inputs
//! tarball is deterministic, carries a manifest naming every node's chart
//! and values files, and is pinned by digests at three levels: the plan
//! hash, the bundle digest in the attestation, and each node's effective
//! input hash re-checked after extraction.

mod tar_util;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ktl_stack_hash::{HashOptions, compute_run_plan_hash, effective_input_hash, is_local_ref};
use ktl_stack_types::Plan;

pub use ed25519_dalek::{SigningKey, VerifyingKey};
pub use tar_util::{Member, extract_members, read_tgz, write_deterministic_tgz};

/// Parse a hex-encoded 32-byte Ed25519 signing key.
pub fn parse_signing_key(hex_key: &str) -> anyhow::Result<SigningKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim())
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| anyhow::anyhow!("signing key must be 32 hex-encoded bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn parse_verifying_key(hex_key: &str) -> anyhow::Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim())
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| anyhow::anyhow!("public key must be 32 hex-encoded bytes"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| anyhow::anyhow!("not a valid ed25519 public key"))
}

/// Manifest format version inside `inputs.tar.gz`.
pub const SEAL_VERSION: &str = "ktl.stack-seal.v1";

pub const PLAN_FILE: &str = "plan.json";
pub const INPUTS_FILE: &str = "inputs.tar.gz";
pub const ATTESTATION_FILE: &str = "attestation.json";
pub const SIGNATURE_FILE: &str = "signature.json";
pub const MANIFEST_FILE: &str = "manifest.json";

/// What went wrong during verification, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealedPlanErrorKind {
    AttestationPlanHashMismatch,
    BundleDigestMismatch,
    PlanHashMismatch,
    ManifestPlanHashMismatch,
    MissingNode,
    EffectiveHashMismatch,
    SignatureInvalid,
}

impl SealedPlanErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttestationPlanHashMismatch => "attestation-plan-hash-mismatch",
            Self::BundleDigestMismatch => "bundle-digest-mismatch",
            Self::PlanHashMismatch => "plan-hash-mismatch",
            Self::ManifestPlanHashMismatch => "manifest-plan-hash-mismatch",
            Self::MissingNode => "missing-node",
            Self::EffectiveHashMismatch => "effective-hash-mismatch",
            Self::SignatureInvalid => "signature-invalid",
        }
    }
}

/// A typed verification failure: which check, what was expected, what was
/// found, and the node involved when the check is per-node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sealed plan verification failed ({}): want {want:?}, got {got:?}{}", kind.as_str(), node_suffix(node_id))]
pub struct SealedPlanError {
    pub kind: SealedPlanErrorKind,
    pub want: String,
    pub got: String,
    pub node_id: Option<String>,
}

fn node_suffix(node_id: &Option<String>) -> String {
    match node_id {
        Some(id) => format!(" (node {id})"),
        None => String::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error(transparent)]
    Verify(#[from] SealedPlanError),
    #[error("node {node_id}: {reason}")]
    Unsealable { node_id: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-node entry in the bundle manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Bundle directory holding the node's files.
    pub root: String,
    /// Chart path relative to the node root, when the chart is local.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    /// Values files relative to the node root.
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SealManifest {
    pub version: String,
    #[serde(rename = "planHash")]
    pub plan_hash: String,
    pub nodes: BTreeMap<String, ManifestNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(rename = "planHash")]
    pub plan_hash: String,
    #[serde(rename = "inputsBundle")]
    pub inputs_bundle: String,
    #[serde(rename = "inputsBundleDigest")]
    pub inputs_bundle_digest: String,
}

/// Detached Ed25519 signature over the sha256 of the bundled
/// `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSignature {
    pub algorithm: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
}

/// Paths written by [`seal`].
#[derive(Debug, Clone)]
pub struct SealedPaths {
    pub dir: PathBuf,
    pub plan: PathBuf,
    pub inputs: PathBuf,
    pub attestation: PathBuf,
}

/// A verified sealed plan, ready for replay. The plan's node directories
/// point into `workdir`, which owns the extracted inputs.
#[derive(Debug)]
pub struct LoadedSealedPlan {
    pub plan: Plan,
    pub manifest: SealManifest,
    pub workdir: tempfile::TempDir,
}

fn bundle_key(node_id: &str) -> String {
    node_id.replace(['/', ':'], "_")
}

/// Seal a plan into `out_dir`: `plan.json` (with its hash embedded), the
/// deterministic `inputs.tar.gz` and the attestation.
pub fn seal(plan: &Plan, out_dir: &Path) -> Result<SealedPaths, SealError> {
    use anyhow::Context;

    let mut sealed_plan = plan.clone();
    sealed_plan.plan_hash = compute_run_plan_hash(plan).map_err(SealError::Other)?;

    let mut members: BTreeMap<String, Member> = BTreeMap::new();
    let mut manifest = SealManifest {
        version: SEAL_VERSION.to_string(),
        plan_hash: sealed_plan.plan_hash.clone(),
        nodes: BTreeMap::new(),
    };

    for node in &plan.nodes {
        let key = bundle_key(&node.id);
        let root = format!("nodes/{key}/files");
        let mut entry = ManifestNode {
            root: root.clone(),
            chart: None,
            values: Vec::new(),
        };

        if is_local_ref(&node.chart) {
            let chart_rel = Path::new(&node.chart);
            if chart_rel.is_absolute() {
                return Err(SealError::Unsealable {
                    node_id: node.id.clone(),
                    reason: format!("chart path {} must be relative", node.chart),
                });
            }
            let chart_dir = node.dir.join(chart_rel);
            add_tree(&mut members, &chart_dir, &format!("{root}/{}", node.chart))
                .with_context(|| format!("failed to bundle chart of {}", node.id))
                .map_err(SealError::Other)?;
            entry.chart = Some(node.chart.clone());
        }

        for value in &node.values {
            if !is_local_ref(value) {
                continue;
            }
            let value_rel = Path::new(value);
            if value_rel.is_absolute() {
                return Err(SealError::Unsealable {
                    node_id: node.id.clone(),
                    reason: format!("values path {value} must be relative"),
                });
            }
            let source = node.dir.join(value_rel);
            let bytes = fs::read(&source)
                .with_context(|| format!("failed to read values file {}", source.display()))
                .map_err(SealError::Other)?;
            members.insert(
                format!("{root}/{value}"),
                Member {
                    bytes,
                    executable: false,
                },
            );
            entry.values.push(value.clone());
        }

        manifest.nodes.insert(node.id.clone(), entry);
    }

    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).map_err(|e| SealError::Other(e.into()))?;
    members.insert(
        MANIFEST_FILE.to_string(),
        Member {
            bytes: manifest_bytes,
            executable: false,
        },
    );

    let inputs_bytes = write_deterministic_tgz(&members).map_err(SealError::Other)?;
    let attestation = Attestation {
        plan_hash: sealed_plan.plan_hash.clone(),
        inputs_bundle: INPUTS_FILE.to_string(),
        inputs_bundle_digest: format!("sha256:{}", hex::encode(Sha256::digest(&inputs_bytes))),
    };

    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))
        .map_err(SealError::Other)?;
    let plan_path = out_dir.join(PLAN_FILE);
    let inputs_path = out_dir.join(INPUTS_FILE);
    let attestation_path = out_dir.join(ATTESTATION_FILE);
    fs::write(
        &plan_path,
        serde_json::to_vec_pretty(&sealed_plan).map_err(|e| SealError::Other(e.into()))?,
    )
    .with_context(|| format!("failed to write {}", plan_path.display()))
    .map_err(SealError::Other)?;
    fs::write(&inputs_path, &inputs_bytes)
        .with_context(|| format!("failed to write {}", inputs_path.display()))
        .map_err(SealError::Other)?;
    fs::write(
        &attestation_path,
        serde_json::to_vec_pretty(&attestation).map_err(|e| SealError::Other(e.into()))?,
    )
    .with_context(|| format!("failed to write {}", attestation_path.display()))
    .map_err(SealError::Other)?;

    Ok(SealedPaths {
        dir: out_dir.to_path_buf(),
        plan: plan_path,
        inputs: inputs_path,
        attestation: attestation_path,
    })
}

fn add_tree(
    members: &mut BTreeMap<String, Member>,
    dir: &Path,
    prefix: &str,
) -> anyhow::Result<()> {
    use anyhow::Context;
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let child = format!("{prefix}/{name}");
        if path.is_dir() {
            add_tree(members, &path, &child)?;
        } else {
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            #[cfg(unix)]
            let executable = {
                use std::os::unix::fs::PermissionsExt;
                entry
                    .metadata()
                    .map(|m| m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false)
            };
            #[cfg(not(unix))]
            let executable = false;
            members.insert(child, Member { bytes, executable });
        }
    }
    Ok(())
}

/// Sign a sealed bundle: Ed25519 over the sha256 of the bundled
/// `manifest.json`. Writes `signature.json` next to the bundle.
pub fn sign(sealed_dir: &Path, key: &SigningKey) -> Result<BundleSignature, SealError> {
    use anyhow::Context;
    let manifest_bytes = read_manifest_bytes(sealed_dir)?;
    let digest = Sha256::digest(&manifest_bytes);
    let signature = key.sign(&digest);
    let envelope = BundleSignature {
        algorithm: "ed25519".to_string(),
        public_key: hex::encode(key.verifying_key().to_bytes()),
        signature: hex::encode(signature.to_bytes()),
    };
    let path = sealed_dir.join(SIGNATURE_FILE);
    fs::write(
        &path,
        serde_json::to_vec_pretty(&envelope).map_err(|e| SealError::Other(e.into()))?,
    )
    .with_context(|| format!("failed to write {}", path.display()))
    .map_err(SealError::Other)?;
    Ok(envelope)
}

/// Verify `signature.json`. When `pinned_key` is given, the envelope's key
/// must match it exactly.
pub fn verify_signature(
    sealed_dir: &Path,
    pinned_key: Option<&VerifyingKey>,
) -> Result<(), SealError> {
    use anyhow::Context;
    let path = sealed_dir.join(SIGNATURE_FILE);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))
        .map_err(SealError::Other)?;
    let envelope: BundleSignature =
        serde_json::from_str(&raw).map_err(|e| SealError::Other(e.into()))?;

    let key_bytes: [u8; 32] = hex::decode(&envelope.public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SealedPlanError {
            kind: SealedPlanErrorKind::SignatureInvalid,
            want: "32-byte hex public key".to_string(),
            got: envelope.public_key.clone(),
            node_id: None,
        })?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| SealedPlanError {
        kind: SealedPlanErrorKind::SignatureInvalid,
        want: "valid ed25519 public key".to_string(),
        got: envelope.public_key.clone(),
        node_id: None,
    })?;

    if let Some(pinned) = pinned_key {
        if pinned != &key {
            return Err(SealedPlanError {
                kind: SealedPlanErrorKind::SignatureInvalid,
                want: hex::encode(pinned.to_bytes()),
                got: envelope.public_key.clone(),
                node_id: None,
            }
            .into());
        }
    }

    let sig_bytes: [u8; 64] = hex::decode(&envelope.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SealedPlanError {
            kind: SealedPlanErrorKind::SignatureInvalid,
            want: "64-byte hex signature".to_string(),
            got: envelope.signature.clone(),
            node_id: None,
        })?;
    let signature = Signature::from_bytes(&sig_bytes);

    let manifest_bytes = read_manifest_bytes(sealed_dir)?;
    let digest = Sha256::digest(&manifest_bytes);
    key.verify(&digest, &signature).map_err(|_| {
        SealError::Verify(SealedPlanError {
            kind: SealedPlanErrorKind::SignatureInvalid,
            want: "valid signature over manifest digest".to_string(),
            got: envelope.signature.clone(),
            node_id: None,
        })
    })
}

fn read_manifest_bytes(sealed_dir: &Path) -> Result<Vec<u8>, SealError> {
    use anyhow::Context;
    let inputs = fs::read(sealed_dir.join(INPUTS_FILE))
        .with_context(|| format!("failed to read {}", sealed_dir.join(INPUTS_FILE).display()))
        .map_err(SealError::Other)?;
    let members = read_tgz(&inputs).map_err(SealError::Other)?;
    members
        .get(MANIFEST_FILE)
        .map(|m| m.bytes.clone())
        .ok_or_else(|| {
            SealError::Other(anyhow::anyhow!("bundle does not contain {MANIFEST_FILE}"))
        })
}

/// Load and verify a sealed plan, in contract order:
///
/// 1. attestation plan hash vs `plan.json`;
/// 2. inputs bundle digest vs attestation;
/// 3. recomputed plan hash vs the stored one;
/// 4. manifest plan hash vs the plan;
/// 5. every plan node present in the manifest;
/// 6. per-node effective input hash recomputed from the extracted inputs.
pub fn load_sealed_plan(dir: &Path, hash: &HashOptions) -> Result<LoadedSealedPlan, SealError> {
    use anyhow::Context;

    let plan_raw = fs::read_to_string(dir.join(PLAN_FILE))
        .with_context(|| format!("failed to read {}", dir.join(PLAN_FILE).display()))
        .map_err(SealError::Other)?;
    let mut plan: Plan = serde_json::from_str(&plan_raw).map_err(|e| SealError::Other(e.into()))?;
    plan.reindex();

    let attestation_raw = fs::read_to_string(dir.join(ATTESTATION_FILE))
        .with_context(|| format!("failed to read {}", dir.join(ATTESTATION_FILE).display()))
        .map_err(SealError::Other)?;
    let attestation: Attestation =
        serde_json::from_str(&attestation_raw).map_err(|e| SealError::Other(e.into()))?;

    // (1) attestation vs plan.json
    if attestation.plan_hash != plan.plan_hash {
        return Err(SealedPlanError {
            kind: SealedPlanErrorKind::AttestationPlanHashMismatch,
            want: plan.plan_hash.clone(),
            got: attestation.plan_hash.clone(),
            node_id: None,
        }
        .into());
    }

    // (2) bundle digest vs attestation
    let inputs_bytes = fs::read(dir.join(&attestation.inputs_bundle))
        .with_context(|| {
            format!(
                "failed to read {}",
                dir.join(&attestation.inputs_bundle).display()
            )
        })
        .map_err(SealError::Other)?;
    let inputs_digest = format!("sha256:{}", hex::encode(Sha256::digest(&inputs_bytes)));
    if inputs_digest != attestation.inputs_bundle_digest {
        return Err(SealedPlanError {
            kind: SealedPlanErrorKind::BundleDigestMismatch,
            want: attestation.inputs_bundle_digest.clone(),
            got: inputs_digest,
            node_id: None,
        }
        .into());
    }

    // (3) recomputed plan hash vs stored
    let recomputed = compute_run_plan_hash(&plan).map_err(SealError::Other)?;
    if recomputed != plan.plan_hash {
        return Err(SealedPlanError {
            kind: SealedPlanErrorKind::PlanHashMismatch,
            want: plan.plan_hash.clone(),
            got: recomputed,
            node_id: None,
        }
        .into());
    }

    // (4) manifest plan hash vs plan
    let members = read_tgz(&inputs_bytes).map_err(SealError::Other)?;
    let manifest_bytes = members
        .get(MANIFEST_FILE)
        .ok_or_else(|| SealError::Other(anyhow::anyhow!("bundle does not contain {MANIFEST_FILE}")))?;
    let manifest: SealManifest =
        serde_json::from_slice(&manifest_bytes.bytes).map_err(|e| SealError::Other(e.into()))?;
    if manifest.plan_hash != plan.plan_hash {
        return Err(SealedPlanError {
            kind: SealedPlanErrorKind::ManifestPlanHashMismatch,
            want: plan.plan_hash.clone(),
            got: manifest.plan_hash.clone(),
            node_id: None,
        }
        .into());
    }

    // (5) every node present in the manifest
    for node in &plan.nodes {
        if !manifest.nodes.contains_key(&node.id) {
            return Err(SealedPlanError {
                kind: SealedPlanErrorKind::MissingNode,
                want: node.id.clone(),
                got: "absent from bundle manifest".to_string(),
                node_id: Some(node.id.clone()),
            }
            .into());
        }
    }

    // (6) extract, rewrite node roots, recompute effective hashes
    let workdir = tempfile::tempdir()
        .context("failed to create extraction dir")
        .map_err(SealError::Other)?;
    extract_members(&members, workdir.path()).map_err(SealError::Other)?;

    for node in &mut plan.nodes {
        let entry = &manifest.nodes[&node.id];
        node.dir = workdir.path().join(&entry.root);
    }
    plan.reindex();

    for node in &plan.nodes {
        let rehashed = effective_input_hash(node, hash).map_err(SealError::Other)?;
        if rehashed.hash != node.effective_input_hash {
            return Err(SealedPlanError {
                kind: SealedPlanErrorKind::EffectiveHashMismatch,
                want: node.effective_input_hash.clone(),
                got: rehashed.hash,
                node_id: Some(node.id.clone()),
            }
            .into());
        }
    }

    Ok(LoadedSealedPlan {
        plan,
        manifest,
        workdir,
    })
}
