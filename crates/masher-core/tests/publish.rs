//! Pointer switching and compose retention on a real filesystem.

use std::path::{Path, PathBuf};

use masher_core::compose::compose_dir_name;
use masher_core::PublishSwitcher;
use masher_state::{PushId, RepoKey, RequestType};

fn compose(root: &Path, repo: &RepoKey, stamp: &str) -> PathBuf {
    let name = format!("{repo}-{stamp}-0123abcd");
    let path = root.join(name);
    std::fs::create_dir_all(path.join("repodata")).unwrap();
    path
}

#[tokio::test]
async fn prune_removes_oldest_but_never_the_published_tree() {
    let dir = tempfile::tempdir().unwrap();
    let composes = dir.path().join("composes");
    let switcher = PublishSwitcher::new(dir.path().join("pub"), &composes);
    let repo = RepoKey::new("F17", RequestType::Stable);

    let oldest = compose(&composes, &repo, "20120601.000000");
    let published = compose(&composes, &repo, "20120602.000000");
    let newer = compose(&composes, &repo, "20120603.000000");
    let newest = compose(&composes, &repo, "20120604.000000");
    switcher.switch(&repo, &published).await.unwrap();

    let removed = switcher.prune(&repo, 1, None).await.unwrap();
    assert_eq!(removed, vec![oldest.clone(), newer.clone()]);
    assert!(!oldest.exists());
    assert!(published.exists());
    assert!(newest.exists());
    assert_eq!(switcher.current(&repo).await.unwrap(), Some(published));
}

#[tokio::test]
async fn prune_spares_composes_of_the_lock_holder() {
    let dir = tempfile::tempdir().unwrap();
    let composes = dir.path().join("composes");
    let switcher = PublishSwitcher::new(dir.path().join("pub"), &composes);
    let repo = RepoKey::new("F17", RequestType::Stable);

    let finished = compose(&composes, &repo, "20120601.000000");
    let running = composes.join(format!("{repo}-20120602.000000-feedf00d"));
    std::fs::create_dir_all(running.join("repodata")).unwrap();
    let holder = PushId("feedf00d-0000-4000-8000-000000000000".to_string());

    let removed = switcher.prune(&repo, 0, Some(&holder)).await.unwrap();
    assert_eq!(removed, vec![finished.clone()]);
    assert!(!finished.exists());
    assert!(running.exists());
}

#[tokio::test]
async fn prune_ignores_other_repositories() {
    let dir = tempfile::tempdir().unwrap();
    let composes = dir.path().join("composes");
    let switcher = PublishSwitcher::new(dir.path().join("pub"), &composes);
    let stable = RepoKey::new("F17", RequestType::Stable);
    let testing = RepoKey::new("F17", RequestType::Testing);

    let testing_tree = compose(&composes, &testing, "20120601.000000");
    compose(&composes, &stable, "20120601.000000");

    let removed = switcher.prune(&stable, 0, None).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(testing_tree.exists());
    assert_eq!(switcher.composes(&testing).await.unwrap(), vec![testing_tree]);
}

#[tokio::test]
async fn readers_always_resolve_a_complete_tree() {
    let dir = tempfile::tempdir().unwrap();
    let composes = dir.path().join("composes");
    let switcher = PublishSwitcher::new(dir.path().join("pub"), &composes);
    let repo = RepoKey::new("F17", RequestType::Stable);

    let short = "89abcdef";
    let a = composes.join(compose_dir_name(&repo, short));
    std::fs::create_dir_all(&a).unwrap();
    std::fs::write(a.join("marker"), b"a").unwrap();
    let b = compose(&composes, &repo, "20990101.000000");
    std::fs::write(b.join("marker"), b"b").unwrap();

    switcher.switch(&repo, &a).await.unwrap();
    let pointer = switcher.pointer(&repo);
    assert_eq!(std::fs::read(pointer.join("marker")).unwrap(), b"a");

    switcher.switch(&repo, &b).await.unwrap();
    assert_eq!(std::fs::read(pointer.join("marker")).unwrap(), b"b");
    // The old compose is kept until pruned.
    assert!(a.exists());
}
