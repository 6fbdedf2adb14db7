use std::env;
use std::process::Command;

/// Output of a git command, empty when git is not available (e.g. in container builds).
fn git(args: &[&str]) -> String {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn main() {
    // If the binary is built within a container, these env variables will be set.
    let version = env::var("VERSION").unwrap_or_else(|_| "latest".to_string());
    let build_date = env::var("BUILD_DATE").unwrap_or_else(|_| chrono::Utc::now().to_rfc3339());
    let git_commit = env::var("GIT_COMMIT").unwrap_or_else(|_| git(&["rev-parse", "HEAD"]));
    let git_tag = env::var("GIT_TAG")
        .unwrap_or_else(|_| git(&["describe", "--exact-match", "--tags", "HEAD"]));
    let git_tree_state = env::var("GIT_TREE_STATE").unwrap_or_else(|_| {
        if git(&["status", "--porcelain"]).is_empty() {
            "clean".to_string()
        } else {
            "dirty".to_string()
        }
    });

    // a clean tree on a tagged commit is an official release
    let version = if !git_commit.is_empty() && !git_tag.is_empty() && git_tree_state == "clean" {
        git_tag.clone()
    } else {
        match git_commit.get(..7) {
            Some(short) if git_tree_state == "clean" => format!("{version}+{short}"),
            Some(short) => format!("{version}+{short}.dirty"),
            None => format!("{version}+unknown"),
        }
    };

    let platform = format!(
        "{}/{}",
        env::var("CARGO_CFG_TARGET_OS").unwrap_or_default(),
        env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default()
    );

    println!(
        "cargo:rustc-env=RIPPLE_VERSION_INFO=Version: {version}, BuildDate: {build_date}, GitCommit: {git_commit}, GitTag: {git_tag}, GitTreeState: {git_tree_state}, Platform: {platform}"
    );
}
