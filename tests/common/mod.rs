//! Shared fixtures: local git repositories and fake agent CLI scripts.

#![allow(dead_code)]

use git2::{Repository, RepositoryInitOptions, Signature};
use std::path::{Path, PathBuf};

/// Create a bare origin repository with one commit on `main`, seeded
/// through a scratch worktree. Returns the path usable as a clone URL.
pub fn init_origin_repo(root: &Path) -> PathBuf {
    let origin_path = root.join("origin.git");
    let mut bare_opts = RepositoryInitOptions::new();
    bare_opts.bare(true).initial_head("main");
    Repository::init_opts(&origin_path, &bare_opts).unwrap();

    let seed_path = root.join("seed");
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let seed = Repository::init_opts(&seed_path, &opts).unwrap();

    std::fs::write(seed_path.join("README.md"), "# fixture\n").unwrap();
    std::fs::create_dir_all(seed_path.join("src")).unwrap();
    std::fs::write(seed_path.join("src/index.ts"), "export {};\n").unwrap();
    commit_all(&seed, "initial commit");

    let mut remote = seed
        .remote("origin", origin_path.to_str().unwrap())
        .unwrap();
    remote
        .push(&["refs/heads/main:refs/heads/main"], None)
        .unwrap();

    origin_path
}

/// Stage everything in the repository and commit it. Returns the new sha.
pub fn commit_all(repo: &Repository, message: &str) -> String {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let signature = Signature::now("Fixture", "fixture@test.local").unwrap();
    let parents: Vec<git2::Commit> = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    let oid = repo
        .commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parent_refs,
        )
        .unwrap();
    oid.to_string()
}

/// Write an executable shell script that plays the agent CLI binary.
#[cfg(unix)]
pub fn write_cli_script(path: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(path, script).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
    path.to_str().unwrap().to_string()
}
