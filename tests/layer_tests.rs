//! Tests for layer composition: validation, shadowing precedence, and
//! teardown.

use chef::layer::{Layer, LayerComposer, validate_layers};
use chef::{Error, pack};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn make_pack(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let content = dir.join(format!("{}-content", name));
    for (path, body) in files {
        let file = content.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, body).unwrap();
    }
    let archive = dir.join(format!("{}.pack", name));
    pack::write_pack(&content, &archive).unwrap();
    archive
}

fn base_rootfs(dir: &Path) -> PathBuf {
    let base = dir.join("base");
    std::fs::create_dir_all(base.join("usr/bin")).unwrap();
    std::fs::write(base.join("usr/bin/tool"), "base-tool").unwrap();
    std::fs::write(base.join("base-only"), "base").unwrap();
    base
}

#[test]
fn test_compose_rejects_empty_layer_list() {
    let temp = TempDir::new().unwrap();
    let composer = LayerComposer::new(temp.path().join("work"));
    let err = composer.compose(&[], "c1").unwrap_err();
    assert!(matches!(err, Error::RootfsInvalid(_)));
}

#[test]
fn test_validation_rules() {
    assert!(validate_layers(&[Layer::base("/a")]).is_ok());
    assert!(validate_layers(&[Layer::base("/a"), Layer::base("/b")]).is_err());
    assert!(validate_layers(&[Layer::upper("/u"), Layer::pack("/p.pack")]).is_err());
    assert!(
        validate_layers(&[
            Layer::base("/a"),
            Layer::pack("/p.pack"),
            Layer::upper("/u")
        ])
        .is_ok()
    );
}

#[test]
fn test_layered_shadowing_last_pack_wins() {
    let temp = TempDir::new().unwrap();
    let base = base_rootfs(temp.path());
    let pack_a = make_pack(temp.path(), "pack-a", &[("usr/bin/tool", "from-pack-a")]);
    let pack_b = make_pack(temp.path(), "pack-b", &[("usr/bin/tool", "from-pack-b")]);
    let composer = LayerComposer::new(temp.path().join("work"));

    // [base, pack-A, pack-B]: reads of the shared path see pack-B.
    let ctx = composer
        .compose(
            &[
                Layer::base(&base),
                Layer::pack(&pack_a),
                Layer::pack(&pack_b),
            ],
            "shadow-1",
        )
        .unwrap();
    let tool = std::fs::read_to_string(ctx.rootfs.join("usr/bin/tool")).unwrap();
    assert_eq!(tool, "from-pack-b");
    // Paths unique to lower layers stay visible.
    assert!(ctx.rootfs.join("base-only").exists());
    composer.destroy(ctx).unwrap();

    // Remove pack-B and recompose: reads see pack-A.
    let ctx = composer
        .compose(
            &[Layer::base(&base), Layer::pack(&pack_a)],
            "shadow-2",
        )
        .unwrap();
    let tool = std::fs::read_to_string(ctx.rootfs.join("usr/bin/tool")).unwrap();
    assert_eq!(tool, "from-pack-a");
    composer.destroy(ctx).unwrap();
}

#[test]
fn test_read_only_flag_tracks_upper() {
    let temp = TempDir::new().unwrap();
    let base = base_rootfs(temp.path());
    let composer = LayerComposer::new(temp.path().join("work"));

    let ro = composer.compose(&[Layer::base(&base)], "ro").unwrap();
    assert!(ro.read_only);
    composer.destroy(ro).unwrap();

    let upper = temp.path().join("upper");
    let rw = composer
        .compose(&[Layer::base(&base), Layer::upper(&upper)], "rw")
        .unwrap();
    assert!(!rw.read_only);
    assert_eq!(rw.upper.as_deref(), Some(upper.as_path()));
    composer.destroy(rw).unwrap();
}

#[test]
fn test_destroy_removes_scratch_and_staging() {
    let temp = TempDir::new().unwrap();
    let base = base_rootfs(temp.path());
    let pack_a = make_pack(temp.path(), "pack-a", &[("etc/conf", "x")]);
    let work = temp.path().join("work");
    let composer = LayerComposer::new(&work);

    let ctx = composer
        .compose(&[Layer::base(&base), Layer::pack(&pack_a)], "gone")
        .unwrap();
    assert_eq!(ctx.pack_digests().len(), 1);
    assert!(work.join("gone").exists());

    composer.destroy(ctx).unwrap();
    assert!(!work.join("gone").exists());
    // The layer sources themselves are untouched.
    assert!(base.exists());
    assert!(pack_a.exists());
}

#[test]
fn test_compose_failure_rolls_back_scratch() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    let composer = LayerComposer::new(&work);

    // A pack that does not exist fails the composition after the
    // scratch tree was created.
    let err = composer
        .compose(
            &[
                Layer::base(base_rootfs(temp.path())),
                Layer::pack(temp.path().join("missing.pack")),
            ],
            "broken",
        )
        .unwrap_err();
    assert!(matches!(err, Error::PackInvalid { .. }));
    assert!(!work.join("broken").exists());
}

#[test]
fn test_keep_on_failure_preserves_scratch() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    let composer = LayerComposer::new(&work).keep_on_failure(true);

    let _ = composer
        .compose(
            &[
                Layer::base(base_rootfs(temp.path())),
                Layer::pack(temp.path().join("missing.pack")),
            ],
            "kept",
        )
        .unwrap_err();
    assert!(work.join("kept").exists());
}

#[test]
fn test_deferred_binds_are_recorded_not_mounted() {
    let temp = TempDir::new().unwrap();
    let base = base_rootfs(temp.path());
    let cache = temp.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    let composer = LayerComposer::new(temp.path().join("work"));

    let ctx = composer
        .compose(
            &[
                Layer::base(&base),
                Layer::bind(&cache, true).at("/ingredients"),
            ],
            "binds",
        )
        .unwrap();
    // The bind only becomes visible after entering the target mount
    // namespace; composition just records it.
    assert_eq!(ctx.deferred_binds().len(), 1);
    assert_eq!(
        ctx.deferred_binds()[0].1,
        std::path::PathBuf::from("/ingredients")
    );
    assert!(ctx.deferred_binds()[0].2);
    composer.destroy(ctx).unwrap();
}
