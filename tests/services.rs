//! The periodic services: auto-import gating and progress warnings.

use std::sync::Arc;
use std::time::Duration;

use bootstream::db::{config_keys, Component, MemoryDb, ResourceDb};
use bootstream::model::{Extra, ResourceKind};
use bootstream::rack::BootImage;
use bootstream::services::{
    warning_rack_has_boot_images, warning_rack_has_no_boot_images, ImportProgressService,
    ImportResourcesService,
};
use bootstream::test_util::{import_context, test_config, FakeMirror, FakeProduct, FakeRack, StaticRacks};

fn focal_mirror() -> FakeMirror {
    FakeMirror::new(vec![FakeProduct::new(
        "ubuntu",
        "amd64/generic",
        "focal",
        "20240101",
    )
    .with_item("squashfs", b"focal bytes")])
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_import_service_imports_on_startup_tick() {
    let db = MemoryDb::with_block_size(16);
    let ctx = Arc::new(import_context(db.clone(), focal_mirror()));
    let handle = ImportResourcesService::new(ctx).start();

    assert!(
        wait_for(|| !db.resources(None).is_empty()).await,
        "first tick fires at startup and imports"
    );
    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_import_service_honors_the_disable_flag() {
    let db = MemoryDb::with_block_size(16);
    db.set_config(config_keys::BOOT_IMAGES_AUTO_IMPORT, "false");
    let ctx = Arc::new(import_context(db.clone(), focal_mirror()));
    let handle = ImportResourcesService::new(ctx).start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(db.resources(None).is_empty());
    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dev_environment_without_sets_never_auto_imports() {
    let db = MemoryDb::with_block_size(16);
    let mut ctx = import_context(db.clone(), focal_mirror());
    ctx.config.dev_environment = true;
    let handle = ImportResourcesService::new(Arc::new(ctx)).start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(db.resources(None).is_empty());
    handle.stop().await;
}

#[tokio::test]
async fn progress_clears_warning_once_region_has_resources() {
    let db = MemoryDb::new();
    db.register_persistent_error(Component::BootImages, "stale warning".to_string());
    db.create_resource(
        ResourceKind::Synced,
        "ubuntu/focal",
        "amd64/generic",
        Extra::new(),
    );
    let service = ImportProgressService::new(
        Arc::new(db.clone()),
        Arc::new(StaticRacks::new(Vec::new())),
        test_config(),
    );
    service.check_boot_images().await;
    assert!(db.persistent_error(Component::BootImages).is_none());
}

#[tokio::test]
async fn progress_warns_when_racks_have_images_but_region_does_not() {
    let db = MemoryDb::new();
    let racks = StaticRacks::new(vec![FakeRack::with_images(vec![BootImage {
        osystem: "ubuntu".to_string(),
        release: "focal".to_string(),
        architecture: "amd64/generic".to_string(),
    }])]);
    let config = test_config();
    let images_url = config.images_url();
    let service = ImportProgressService::new(Arc::new(db.clone()), Arc::new(racks), config);
    service.check_boot_images().await;
    assert_eq!(
        db.persistent_error(Component::BootImages),
        Some(warning_rack_has_boot_images(&images_url))
    );
}

#[tokio::test]
async fn progress_warns_import_not_started_when_nobody_has_images() {
    let db = MemoryDb::new();
    let racks = StaticRacks::new(vec![FakeRack::empty(), FakeRack::unreachable()]);
    let config = test_config();
    let images_url = config.images_url();
    let service = ImportProgressService::new(Arc::new(db.clone()), Arc::new(racks), config);
    service.check_boot_images().await;
    let warning = db.persistent_error(Component::BootImages).unwrap();
    assert_eq!(warning, warning_rack_has_no_boot_images(&images_url));
    assert!(warning.contains(&images_url));
}

#[tokio::test]
async fn legacy_racks_are_seen_through_the_fallback_command() {
    let db = MemoryDb::new();
    let racks = StaticRacks::new(vec![FakeRack::legacy_only(vec![BootImage {
        osystem: "ubuntu".to_string(),
        release: "focal".to_string(),
        architecture: "amd64/generic".to_string(),
    }])]);
    let config = test_config();
    let images_url = config.images_url();
    let service = ImportProgressService::new(Arc::new(db.clone()), Arc::new(racks), config);
    service.check_boot_images().await;
    assert_eq!(
        db.persistent_error(Component::BootImages),
        Some(warning_rack_has_boot_images(&images_url))
    );
}
