//! Integration tests for pvefw
//!
//! These tests exercise the full configuration pipeline: a scratch
//! configuration tree is laid out on disk, loaded through the same paths
//! the daemon uses, compiled, and diffed. No kernel access is required;
//! reconciliation against a live filter is covered by the in-crate mock
//! kernel tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pvefw::config::FwPaths;
use pvefw::core::compile::compile_from_paths;
use pvefw::core::reconcile::{ChainAction, chain_digest, diff};

/// Creates a per-test scratch root under the system temp directory.
fn scratch(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("pvefw-it-{name}-{}", std::process::id()));
    std::fs::remove_dir_all(&root).ok();
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Lays out one VM with two interfaces, a security group, and a host rule
/// file.
fn standard_tree(root: &Path) -> FwPaths {
    let paths = FwPaths::under(root);
    write(
        &paths.vm_conf_dir.join("100.conf"),
        "memory: 2048\n\
         net0: virtio=aa:bb:cc:dd:ee:01,bridge=vmbr0\n\
         net1: virtio=aa:bb:cc:dd:ee:02,bridge=vmbr1,tag=20\n",
    );
    write(
        &paths.firewall_dir.join("100.fw"),
        "[options]\n\
         policy-in: DROP\n\
         [in]\n\
         SSH(ACCEPT) net0 - - - - -\n\
         GROUP-web - - - - - -\n\
         [out]\n\
         GROUP-web - - - - - -\n",
    );
    write(
        &paths.firewall_dir.join("groups.fw"),
        "[in:web]\n\
         ACCEPT - - tcp 80,443 -\n\
         [out:web]\n\
         ACCEPT - - tcp 80 -\n",
    );
    write(
        &paths.host_fw_file.clone(),
        "[in]\n\
         ACCEPT - - - tcp 8006 -\n",
    );
    paths
}

#[test]
fn test_full_tree_compiles_expected_chains() {
    let root = scratch("full");
    let paths = standard_tree(&root);
    let ruleset = compile_from_paths(&paths).unwrap();

    for chain in [
        "PVEFW-INPUT",
        "PVEFW-OUTPUT",
        "PVEFW-FORWARD",
        "PVEFW-SET-ACCEPT-MARK",
        "PVEFW-HOST-IN",
        "PVEFW-HOST-OUT",
        "vmbr0-FW",
        "vmbr0-IN",
        "vmbr0-OUT",
        "vmbr1-FW",
        "vmbr1-IN",
        "vmbr1-OUT",
        "tap100i0-IN",
        "tap100i0-OUT",
        "tap100i1-IN",
        "tap100i1-OUT",
        "GROUP-web-IN",
        "GROUP-web-OUT",
    ] {
        assert!(ruleset.contains(chain), "missing chain {chain}");
    }

    // the ssh macro is bound to net0 and must not leak onto net1
    assert!(
        ruleset
            .get("tap100i0-IN")
            .unwrap()
            .contains(&"-A tap100i0-IN -p tcp --dport 22 -j ACCEPT".to_string())
    );
    assert!(
        !ruleset
            .get("tap100i1-IN")
            .unwrap()
            .iter()
            .any(|cmd| cmd.contains("--dport 22"))
    );

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_empty_tree_compiles_base_chains_only() {
    let root = scratch("empty");
    let paths = FwPaths::under(&root);
    let ruleset = compile_from_paths(&paths).unwrap();

    assert_eq!(ruleset.len(), 4);
    assert!(ruleset.contains("PVEFW-INPUT"));
    assert!(ruleset.contains("PVEFW-OUTPUT"));
    assert!(ruleset.contains("PVEFW-FORWARD"));
    assert!(ruleset.contains("PVEFW-SET-ACCEPT-MARK"));

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_vm_without_rule_file_gets_no_chains() {
    let root = scratch("nofw");
    let paths = FwPaths::under(&root);
    write(
        &paths.vm_conf_dir.join("200.conf"),
        "net0: virtio=aa:bb:cc:dd:ee:03,bridge=vmbr0\n",
    );
    let ruleset = compile_from_paths(&paths).unwrap();
    assert!(!ruleset.contains("tap200i0-IN"));
    assert!(!ruleset.contains("vmbr0-FW"));

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_empty_vm_rule_file_gets_default_chains() {
    let root = scratch("emptyfw");
    let paths = FwPaths::under(&root);
    write(
        &paths.vm_conf_dir.join("300.conf"),
        "net0: virtio=aa:bb:cc:dd:ee:04,bridge=vmbr0\n",
    );
    write(&paths.firewall_dir.join("300.fw"), "");

    let ruleset = compile_from_paths(&paths).unwrap();
    let tap_in = ruleset.get("tap300i0-IN").unwrap();
    // preamble plus default-policy tail, nothing else
    assert_eq!(
        tap_in,
        &[
            "-A tap300i0-IN -m state --state INVALID -j DROP",
            "-A tap300i0-IN -m state --state RELATED,ESTABLISHED -j ACCEPT",
            "-A tap300i0-IN -j LOG --log-prefix \"tap300i0-IN-dropped: \" --log-level 4",
            "-A tap300i0-IN -j DROP",
        ]
    );
    assert_eq!(
        ruleset.get("tap300i0-OUT").unwrap().last().unwrap(),
        "-A tap300i0-OUT -j RETURN"
    );

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_recompile_is_stable_and_diff_converges() {
    let root = scratch("stable");
    let paths = standard_tree(&root);

    let first = compile_from_paths(&paths).unwrap();
    let second = compile_from_paths(&paths).unwrap();
    assert_eq!(first, second);

    // a kernel that matches the compiled signatures reports no work
    let active: BTreeMap<String, String> = first
        .iter()
        .map(|(chain, cmds)| (chain.clone(), chain_digest(cmds)))
        .collect();
    let status = diff(&first, &active);
    assert!(status.values().all(|st| st.action == ChainAction::Exists));

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_config_edit_updates_only_affected_chains() {
    let root = scratch("edit");
    let paths = standard_tree(&root);
    let before = compile_from_paths(&paths).unwrap();
    let active: BTreeMap<String, String> = before
        .iter()
        .map(|(chain, cmds)| (chain.clone(), chain_digest(cmds)))
        .collect();

    // widen the VM's inbound rules
    write(
        &paths.firewall_dir.join("100.fw"),
        "[options]\n\
         policy-in: DROP\n\
         [in]\n\
         SSH(ACCEPT) net0 - - - - -\n\
         HTTP(ACCEPT) net0 - - - - -\n\
         GROUP-web - - - - - -\n\
         [out]\n\
         GROUP-web - - - - - -\n",
    );
    let after = compile_from_paths(&paths).unwrap();
    let status = diff(&after, &active);

    assert_eq!(status.get("tap100i0-IN").unwrap().action, ChainAction::Update);
    assert_eq!(status.get("tap100i0-OUT").unwrap().action, ChainAction::Exists);
    assert_eq!(status.get("GROUP-web-IN").unwrap().action, ChainAction::Exists);
    assert_eq!(status.get("PVEFW-INPUT").unwrap().action, ChainAction::Exists);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_group_removal_yields_delete() {
    let root = scratch("groupdel");
    let paths = standard_tree(&root);
    let before = compile_from_paths(&paths).unwrap();
    let active: BTreeMap<String, String> = before
        .iter()
        .map(|(chain, cmds)| (chain.clone(), chain_digest(cmds)))
        .collect();

    // drop the group references from the VM file
    write(
        &paths.firewall_dir.join("100.fw"),
        "[in]\nSSH(ACCEPT) net0 - - - - -\n",
    );
    let after = compile_from_paths(&paths).unwrap();
    let status = diff(&after, &active);

    assert_eq!(status.get("GROUP-web-IN").unwrap().action, ChainAction::Delete);
    assert_eq!(status.get("GROUP-web-OUT").unwrap().action, ChainAction::Delete);

    std::fs::remove_dir_all(&root).ok();
}
