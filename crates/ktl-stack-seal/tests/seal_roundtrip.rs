use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ed25519_dalek::SigningKey;
use sha2::Digest;

use ktl_stack_hash::{HashOptions, effective_input_hash};
use ktl_stack_seal::{
    INPUTS_FILE, PLAN_FILE, SealError, SealedPlanErrorKind, load_sealed_plan, seal, sign,
    verify_signature,
};
use ktl_stack_types::{ClusterTarget, HookConfig, Plan, ResolvedRelease, RunnerConfig};

fn hash_opts() -> HashOptions {
    HashOptions {
        include_values_contents: true,
        ..HashOptions::default()
    }
}

/// A stack root with one release: a chart dir and a values file.
fn seed_release(root: &Path, name: &str) -> ResolvedRelease {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("charts").join(name)).expect("chart dir");
    fs::write(
        dir.join("charts").join(name).join("Chart.yaml"),
        format!("name: {name}\nversion: 1.0.0\n"),
    )
    .expect("chart file");
    fs::write(dir.join("values.yaml"), "replicas: 2\n").expect("values");

    let mut node = ResolvedRelease {
        id: ResolvedRelease::make_id("prod", "default", name),
        name: name.to_string(),
        dir,
        cluster: ClusterTarget {
            name: "prod".to_string(),
            kubeconfig: None,
            context: None,
        },
        namespace: "default".to_string(),
        chart: format!("charts/{name}"),
        values: vec!["values.yaml".to_string()],
        set: BTreeMap::new(),
        tags: Default::default(),
        needs: vec![],
        apply: Default::default(),
        delete: Default::default(),
        hooks: HookConfig::default(),
        role: Default::default(),
        wave: 0,
        parallelism_group: String::new(),
        execution_group: 0,
        effective_input_hash: String::new(),
        inputs_cursor: serde_json::Value::Null,
        selected_by: vec![],
    };
    let hashed = effective_input_hash(&node, &hash_opts()).expect("hash");
    node.effective_input_hash = hashed.hash;
    node.inputs_cursor = hashed.inputs_cursor;
    node
}

fn seed_plan(root: &Path) -> Plan {
    let nodes = vec![seed_release(root, "api"), seed_release(root, "db")];
    let order = nodes.iter().map(|n| n.id.clone()).collect();
    Plan::new(
        root.to_path_buf(),
        "demo".to_string(),
        None,
        nodes,
        order,
        RunnerConfig::default(),
        HookConfig::default(),
    )
}

#[test]
fn sealed_plan_roundtrips_with_matching_hashes() {
    let td = tempfile::tempdir().expect("tempdir");
    let plan = seed_plan(td.path());
    let sealed_dir = td.path().join("sealed");

    let paths = seal(&plan, &sealed_dir).expect("seal");
    assert!(paths.plan.exists());
    assert!(paths.inputs.exists());
    assert!(paths.attestation.exists());

    let loaded = load_sealed_plan(&sealed_dir, &hash_opts()).expect("load");
    assert_eq!(loaded.plan.nodes.len(), 2);
    for (loaded_node, original) in loaded.plan.nodes.iter().zip(plan.nodes.iter()) {
        assert_eq!(loaded_node.effective_input_hash, original.effective_input_hash);
        assert_ne!(loaded_node.dir, original.dir, "dirs point into the extraction");
        assert!(loaded_node.dir.join("values.yaml").exists());
    }
}

#[test]
fn sealing_is_deterministic() {
    let td = tempfile::tempdir().expect("tempdir");
    let plan = seed_plan(td.path());

    seal(&plan, &td.path().join("sealed-a")).expect("seal a");
    seal(&plan, &td.path().join("sealed-b")).expect("seal b");
    let a = fs::read(td.path().join("sealed-a").join(INPUTS_FILE)).expect("read a");
    let b = fs::read(td.path().join("sealed-b").join(INPUTS_FILE)).expect("read b");
    assert_eq!(a, b, "inputs bundle must be byte-identical");
}

#[test]
fn tampered_inputs_bundle_is_a_bundle_digest_mismatch() {
    let td = tempfile::tempdir().expect("tempdir");
    let plan = seed_plan(td.path());
    let sealed_dir = td.path().join("sealed");
    seal(&plan, &sealed_dir).expect("seal");

    let inputs_path = sealed_dir.join(INPUTS_FILE);
    let mut bytes = fs::read(&inputs_path).expect("read");
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&inputs_path, &bytes).expect("tamper");

    let err = load_sealed_plan(&sealed_dir, &hash_opts()).expect_err("must fail");
    match err {
        SealError::Verify(e) => assert_eq!(e.kind, SealedPlanErrorKind::BundleDigestMismatch),
        other => panic!("expected verify error, got {other:?}"),
    }
}

#[test]
fn tampered_plan_json_is_a_plan_hash_mismatch() {
    let td = tempfile::tempdir().expect("tempdir");
    let plan = seed_plan(td.path());
    let sealed_dir = td.path().join("sealed");
    seal(&plan, &sealed_dir).expect("seal");

    let plan_path = sealed_dir.join(PLAN_FILE);
    let raw = fs::read_to_string(&plan_path).expect("read");
    let tampered = raw.replace("\"stack_name\": \"demo\"", "\"stack_name\": \"evil\"");
    assert_ne!(raw, tampered, "replacement must hit");
    fs::write(&plan_path, tampered).expect("tamper");

    let err = load_sealed_plan(&sealed_dir, &hash_opts()).expect_err("must fail");
    match err {
        SealError::Verify(e) => assert_eq!(e.kind, SealedPlanErrorKind::PlanHashMismatch),
        other => panic!("expected verify error, got {other:?}"),
    }
}

#[test]
fn values_tamper_inside_the_bundle_fails_the_effective_hash() {
    let td = tempfile::tempdir().expect("tempdir");
    let plan = seed_plan(td.path());
    let sealed_dir = td.path().join("sealed");
    seal(&plan, &sealed_dir).expect("seal");

    // Rebuild the bundle with one values file changed, keeping the
    // attestation digest in sync so the failure surfaces at the per-node
    // hash check.
    let inputs_path = sealed_dir.join(INPUTS_FILE);
    let bytes = fs::read(&inputs_path).expect("read");
    let mut members = ktl_stack_seal::read_tgz(&bytes).expect("members");
    let values_key = members
        .keys()
        .find(|k| k.ends_with("values.yaml"))
        .expect("values member")
        .clone();
    members.get_mut(&values_key).unwrap().bytes = b"replicas: 99\n".to_vec();
    let rebuilt = ktl_stack_seal::write_deterministic_tgz(&members).expect("rebuild");
    fs::write(&inputs_path, &rebuilt).expect("write");

    let attestation_path = sealed_dir.join("attestation.json");
    let mut attestation: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&attestation_path).expect("read")).expect("json");
    attestation["inputsBundleDigest"] = serde_json::json!(format!(
        "sha256:{}",
        hex::encode(sha2::Sha256::digest(&rebuilt))
    ));
    fs::write(
        &attestation_path,
        serde_json::to_vec_pretty(&attestation).expect("json"),
    )
    .expect("write");

    let err = load_sealed_plan(&sealed_dir, &hash_opts()).expect_err("must fail");
    match err {
        SealError::Verify(e) => {
            assert_eq!(e.kind, SealedPlanErrorKind::EffectiveHashMismatch);
            assert!(e.node_id.is_some());
        }
        other => panic!("expected verify error, got {other:?}"),
    }
}

#[test]
fn missing_node_in_manifest_is_detected() {
    let td = tempfile::tempdir().expect("tempdir");
    let plan = seed_plan(td.path());
    let sealed_dir = td.path().join("sealed");
    seal(&plan, &sealed_dir).expect("seal");

    // Drop one node from the manifest and re-point the attestation at the
    // rebuilt bundle.
    let inputs_path = sealed_dir.join(INPUTS_FILE);
    let bytes = fs::read(&inputs_path).expect("read");
    let mut members = ktl_stack_seal::read_tgz(&bytes).expect("members");
    let manifest_member = members.get_mut("manifest.json").expect("manifest");
    let mut manifest: serde_json::Value =
        serde_json::from_slice(&manifest_member.bytes).expect("json");
    manifest["nodes"]
        .as_object_mut()
        .unwrap()
        .remove("prod/default/db");
    manifest_member.bytes = serde_json::to_vec_pretty(&manifest).expect("json");
    let rebuilt = ktl_stack_seal::write_deterministic_tgz(&members).expect("rebuild");
    fs::write(&inputs_path, &rebuilt).expect("write");

    let attestation_path = sealed_dir.join("attestation.json");
    let mut attestation: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&attestation_path).expect("read")).expect("json");
    attestation["inputsBundleDigest"] = serde_json::json!(format!(
        "sha256:{}",
        hex::encode(sha2::Sha256::digest(&rebuilt))
    ));
    fs::write(
        &attestation_path,
        serde_json::to_vec_pretty(&attestation).expect("json"),
    )
    .expect("write");

    let err = load_sealed_plan(&sealed_dir, &hash_opts()).expect_err("must fail");
    match err {
        SealError::Verify(e) => {
            assert_eq!(e.kind, SealedPlanErrorKind::MissingNode);
            assert_eq!(e.node_id.as_deref(), Some("prod/default/db"));
        }
        other => panic!("expected verify error, got {other:?}"),
    }
}

#[test]
fn signature_roundtrip_and_tamper_detection() {
    let td = tempfile::tempdir().expect("tempdir");
    let plan = seed_plan(td.path());
    let sealed_dir = td.path().join("sealed");
    seal(&plan, &sealed_dir).expect("seal");

    let key = SigningKey::from_bytes(&[7u8; 32]);
    let envelope = sign(&sealed_dir, &key).expect("sign");
    assert_eq!(envelope.algorithm, "ed25519");

    verify_signature(&sealed_dir, None).expect("verifies");
    verify_signature(&sealed_dir, Some(&key.verifying_key())).expect("verifies pinned");

    // A different pinned key is rejected.
    let other = SigningKey::from_bytes(&[9u8; 32]);
    let err =
        verify_signature(&sealed_dir, Some(&other.verifying_key())).expect_err("wrong key");
    match err {
        SealError::Verify(e) => assert_eq!(e.kind, SealedPlanErrorKind::SignatureInvalid),
        other => panic!("expected verify error, got {other:?}"),
    }

    // Tampering with the signature itself is rejected.
    let sig_path = sealed_dir.join("signature.json");
    let raw = fs::read_to_string(&sig_path).expect("read");
    let mut envelope: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let mut sig = envelope["signature"].as_str().unwrap().to_string();
    let flipped = if sig.ends_with('0') { "1" } else { "0" };
    sig.replace_range(sig.len() - 1.., flipped);
    envelope["signature"] = serde_json::json!(sig);
    fs::write(&sig_path, serde_json::to_vec_pretty(&envelope).expect("json")).expect("write");

    let err = verify_signature(&sealed_dir, None).expect_err("tampered");
    match err {
        SealError::Verify(e) => assert_eq!(e.kind, SealedPlanErrorKind::SignatureInvalid),
        other => panic!("expected verify error, got {other:?}"),
    }
}
