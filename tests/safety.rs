//! Safety Policy Integration Tests
//!
//! Policies as packs declare them, and the merged result of several packs.

use std::path::Path;

use stepkernel::core::{
    merge_pack_safety_policies, KernelConfig, NetworkAccess, SafetyPolicy, SafetyViolation,
};
use stepkernel::domain::PackDefinition;

fn policy_from_yaml(yaml: &str) -> SafetyPolicy {
    serde_yaml::from_str(yaml).unwrap()
}

#[test]
fn test_policy_defaults_are_closed() {
    let policy = policy_from_yaml("{}");

    assert_eq!(policy.network_access, NetworkAccess::Deny);
    assert!(policy.check_network().is_err());
    assert!(policy.check_tool("cargo").is_err());
    assert!(matches!(
        policy.check_write(Path::new("src/lib.rs"), None),
        Err(SafetyViolation::WriteNotAllowed { .. })
    ));
    // No limit configured
    assert!(policy.check_diff_size(u64::MAX).is_ok());
}

#[test]
fn test_write_checks() {
    let policy = policy_from_yaml(
        r#"
allow_write_paths: ["src/**", "docs/*.md"]
deny_write_paths: ["**/secrets/**"]
max_diff_size_bytes: 100
"#,
    );

    assert!(policy.check_write(Path::new("src/core/mod.rs"), Some(100)).is_ok());
    assert!(policy.check_write(Path::new("docs/guide.md"), None).is_ok());

    match policy.check_write(Path::new("src/secrets/token.txt"), None) {
        Err(SafetyViolation::WriteDenied { path, pattern }) => {
            assert_eq!(path, "src/secrets/token.txt");
            assert_eq!(pattern, "**/secrets/**");
        }
        other => panic!("Expected WriteDenied, got {:?}", other),
    }

    match policy.check_write(Path::new("src/main.rs"), Some(101)) {
        Err(SafetyViolation::DiffTooLarge { actual, limit }) => {
            assert_eq!(actual, 101);
            assert_eq!(limit, 100);
        }
        other => panic!("Expected DiffTooLarge, got {:?}", other),
    }
}

#[test]
fn test_merge_never_weakens() {
    let strict = policy_from_yaml(
        r#"
allow_write_paths: ["src/**"]
deny_write_paths: ["**/*.key"]
allowed_tools: [cargo]
max_diff_size_bytes: 1000
network_access: deny
"#,
    );
    let loose = policy_from_yaml(
        r#"
allow_write_paths: ["src/**", "scripts/**"]
allowed_tools: [cargo, curl, git]
network_access: allow
"#,
    );

    // Order does not matter for the permissions that survive
    for merged in [
        merge_pack_safety_policies([&strict, &loose]).unwrap(),
        merge_pack_safety_policies([&loose, &strict]).unwrap(),
    ] {
        assert_eq!(merged.allow_write_paths, vec!["src/**"]);
        assert_eq!(merged.allowed_tools, vec!["cargo"]);
        assert_eq!(merged.deny_write_paths, vec!["**/*.key"]);
        assert_eq!(merged.max_diff_size_bytes, Some(1000));
        assert_eq!(merged.network_access, NetworkAccess::Deny);

        assert!(merged.check_write(Path::new("scripts/run.sh"), None).is_err());
        assert!(merged.check_write(Path::new("src/id.key"), None).is_err());
        assert!(merged.check_tool("curl").is_err());
    }
}

#[test]
fn test_disjoint_packs_allow_no_writes() {
    let mut docs = PackDefinition::new("docs", "1.0.0");
    docs.default_safety_policy = Some(policy_from_yaml(r#"allow_write_paths: ["docs/**"]"#));
    let mut code = PackDefinition::new("code", "1.0.0");
    code.default_safety_policy = Some(policy_from_yaml(r#"allow_write_paths: ["src/**"]"#));
    let silent = PackDefinition::new("silent", "1.0.0");

    let kernel = KernelConfig::from_packs(&[docs, silent, code]).unwrap();
    let policy = kernel.safety_policy.unwrap();

    assert!(policy.allow_write_paths.is_empty());
    assert!(policy.check_write(Path::new("docs/a.md"), None).is_err());
    assert!(policy.check_write(Path::new("src/a.rs"), None).is_err());
}

#[test]
fn test_no_policy_without_contributors() {
    let kernel = KernelConfig::from_packs(&[PackDefinition::new("bare", "1.0.0")]).unwrap();
    assert!(kernel.safety_policy.is_none());
    assert_eq!(kernel.packs.len(), 1);
}
