//! End-to-end import runs against an in-memory store and a fake mirror.

use std::sync::Arc;

use bootstream::db::{config_keys, MemoryDb, ResourceDb, IMPORT_IMAGES_LOCK};
use bootstream::import::{
    import_resources, import_resources_now, FinalizeOutcome, ImportContext, ImportOutcome,
    ResourceImporter,
};
use bootstream::model::{Extra, FileKind, ResourceKind};
use bootstream::server::product_index;
use bootstream::test_util::{
    fake_boot_source, import_context, sha256_hex, test_config, FakeMirror, FakeProduct,
    FakeReaderFactory, RecordingRackImporter,
};

fn db() -> MemoryDb {
    MemoryDb::with_block_size(16)
}

async fn run(ctx: &ImportContext) -> ImportOutcome {
    import_resources_now(ctx).await.expect("import run failed")
}

fn published_products(db: &MemoryDb) -> Vec<String> {
    product_index(db).index["maas:v2:download"].products.clone()
}

#[tokio::test]
async fn cold_start_imports_two_products() {
    let db = db();
    let mirror = FakeMirror::new(vec![
        FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101")
            .with_item("squashfs", &[0xAA; 100]),
        FakeProduct::new("ubuntu", "amd64/generic", "jammy", "20240101")
            .with_item("squashfs", &[0xBB; 200]),
    ]);
    let ctx = import_context(db.clone(), mirror);

    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let resources = db.resources(Some(ResourceKind::Synced));
    assert_eq!(resources.len(), 2);
    for resource in &resources {
        let set = db
            .get_latest_complete_set(resource.id)
            .expect("every imported resource has a complete set");
        let files = db.files_of(set.id);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filetype, FileKind::Squashfs);
    }
    assert_eq!(
        published_products(&db),
        vec![
            "maas:boot:ubuntu:amd64:generic:focal".to_string(),
            "maas:boot:ubuntu:amd64:generic:jammy".to_string(),
        ]
    );
}

#[tokio::test]
async fn squashfs_supersedes_root_image_in_same_version() {
    let db = db();
    let mirror = FakeMirror::new(vec![FakeProduct::new(
        "ubuntu",
        "amd64/generic",
        "focal",
        "20240101",
    )
    .with_item("root-image.gz", b"gzipped root")
    .with_item("squashfs", b"squashed root")]);
    let ctx = import_context(db.clone(), mirror);

    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let resource = &db.resources(Some(ResourceKind::Synced))[0];
    let set = db.get_latest_complete_set(resource.id).unwrap();
    let files = db.files_of(set.id);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filetype, FileKind::Squashfs);
}

#[tokio::test]
async fn unknown_filetypes_are_skipped_silently() {
    let db = db();
    let mirror = FakeMirror::new(vec![FakeProduct::new(
        "ubuntu",
        "amd64/generic",
        "focal",
        "20240101",
    )
    .with_item("squashfs", b"squashed root")
    .with_item("bootloader", b"mystery bytes")]);
    let ctx = import_context(db.clone(), mirror);

    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let resource = &db.resources(Some(ResourceKind::Synced))[0];
    let set = db.get_latest_complete_set(resource.id).unwrap();
    assert_eq!(db.files_of(set.id).len(), 1);
}

#[tokio::test]
async fn identical_content_shares_one_largefile() {
    let db = db();
    let payload = b"shared bytes across series";
    let mirror = FakeMirror::new(vec![
        FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101")
            .with_item("squashfs", payload),
        FakeProduct::new("ubuntu", "amd64/generic", "jammy", "20240101")
            .with_item("squashfs", payload),
    ]);
    let ctx = import_context(db.clone(), mirror);

    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let mut largefile_ids = Vec::new();
    for resource in db.resources(Some(ResourceKind::Synced)) {
        let set = db.get_latest_complete_set(resource.id).unwrap();
        for file in db.files_of(set.id) {
            largefile_ids.push(file.largefile_id.unwrap());
        }
    }
    assert_eq!(largefile_ids.len(), 2);
    assert_eq!(largefile_ids[0], largefile_ids[1]);

    let largefile = db.find_largefile_by_sha256(&sha256_hex(payload)).unwrap();
    assert_eq!(largefile.total_size, payload.len() as u64);
    assert!(db.largefile_complete(&largefile));
}

#[tokio::test]
async fn checksum_mismatch_drops_only_the_corrupt_product() {
    let db = db();
    let mirror = FakeMirror::new(vec![
        FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101").with_corrupt_item(
            "squashfs",
            b"actual bytes",
            &sha256_hex(b"declared other bytes"),
        ),
        FakeProduct::new("ubuntu", "amd64/generic", "jammy", "20240101")
            .with_item("squashfs", b"good bytes"),
    ]);
    let ctx = import_context(db.clone(), mirror);

    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    // The corrupt file was deleted, its set collapsed, and its blob
    // reclaimed; the healthy product is untouched.
    assert_eq!(
        published_products(&db),
        vec!["maas:boot:ubuntu:amd64:generic:jammy".to_string()]
    );
    assert!(db
        .find_largefile_by_sha256(&sha256_hex(b"declared other bytes"))
        .is_none());
    assert!(db
        .find_largefile_by_sha256(&sha256_hex(b"good bytes"))
        .is_some());
}

#[tokio::test]
async fn safety_gate_preserves_everything_when_upstream_overlaps_nothing() {
    let db = db();
    let products = vec![
        FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101")
            .with_item("squashfs", b"focal bytes"),
        FakeProduct::new("ubuntu", "amd64/generic", "jammy", "20240101")
            .with_item("squashfs", b"jammy bytes"),
        FakeProduct::new("ubuntu", "arm64/generic", "jammy", "20240101")
            .with_item("squashfs", b"arm bytes"),
    ];
    let ctx = import_context(db.clone(), FakeMirror::new(products.clone()));
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);
    assert_eq!(db.resources(Some(ResourceKind::Synced)).len(), 3);

    // Same pedigrees described, but the enumeration yields no items at
    // all: indistinguishable from a broken upstream, so nothing may be
    // deleted.
    let silent: Vec<FakeProduct> = products
        .into_iter()
        .map(|mut product| {
            product.items.clear();
            product
        })
        .collect();
    let ctx = import_context(db.clone(), FakeMirror::new(silent));
    assert_eq!(run(&ctx).await, ImportOutcome::Skipped);

    let resources = db.resources(Some(ResourceKind::Synced));
    assert_eq!(resources.len(), 3);
    for resource in &resources {
        assert!(db.get_latest_complete_set(resource.id).is_some());
    }
}

#[tokio::test]
async fn empty_descriptions_abort_before_touching_the_store() {
    let db = db();
    let ctx = import_context(db.clone(), FakeMirror::empty());
    assert_eq!(run(&ctx).await, ImportOutcome::Skipped);
    assert!(db.resources(None).is_empty());
}

#[tokio::test]
async fn generated_resource_is_promoted_keeping_its_id() {
    let db = db();
    let generated = db.create_resource(
        ResourceKind::Generated,
        "ubuntu/focal",
        "amd64/generic",
        Extra::new(),
    );
    let mirror = FakeMirror::new(vec![FakeProduct::new(
        "ubuntu",
        "amd64/generic",
        "focal",
        "20240101",
    )
    .with_item("squashfs", b"upstream now has it")]);
    let ctx = import_context(db.clone(), mirror);

    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let resource = db.get_resource(generated.id).expect("still the same row");
    assert_eq!(resource.kind, ResourceKind::Synced);
    assert_eq!(db.resources(None).len(), 1);
}

#[tokio::test]
async fn reconciler_deletes_resources_gone_from_upstream() {
    let db = db();
    let ctx = import_context(
        db.clone(),
        FakeMirror::new(vec![
            FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101")
                .with_item("squashfs", b"focal bytes"),
            FakeProduct::new("ubuntu", "amd64/generic", "jammy", "20240101")
                .with_item("squashfs", b"jammy bytes"),
        ]),
    );
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let ctx = import_context(
        db.clone(),
        FakeMirror::new(vec![FakeProduct::new(
            "ubuntu",
            "amd64/generic",
            "jammy",
            "20240102",
        )
        .with_item("squashfs", b"jammy bytes v2")]),
    );
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let resources = db.resources(Some(ResourceKind::Synced));
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].name, "ubuntu/jammy");
    // The focal blob went with its resource.
    assert!(db
        .find_largefile_by_sha256(&sha256_hex(b"focal bytes"))
        .is_none());
}

#[tokio::test]
async fn reimporting_the_same_catalog_is_idempotent() {
    let db = db();
    let mirror = FakeMirror::new(vec![
        FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101")
            .with_item("squashfs", b"focal bytes"),
        FakeProduct::new("ubuntu", "amd64/generic", "jammy", "20240101")
            .with_item("squashfs", b"jammy bytes"),
    ]);
    let ctx = import_context(db.clone(), mirror.clone());
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let resources_before = db.resources(None);
    let sets_before: Vec<_> = resources_before
        .iter()
        .flat_map(|resource| db.sets_of(resource.id))
        .collect();
    let files_before: Vec<_> = sets_before
        .iter()
        .flat_map(|set| db.files_of(set.id))
        .collect();

    let ctx = import_context(db.clone(), mirror);
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    assert_eq!(db.resources(None), resources_before);
    let sets_after: Vec<_> = resources_before
        .iter()
        .flat_map(|resource| db.sets_of(resource.id))
        .collect();
    assert_eq!(sets_after, sets_before);
    let files_after: Vec<_> = sets_after
        .iter()
        .flat_map(|set| db.files_of(set.id))
        .collect();
    assert_eq!(files_after, files_before);
}

#[tokio::test]
async fn newer_complete_set_replaces_the_old_one() {
    let db = db();
    let ctx = import_context(
        db.clone(),
        FakeMirror::new(vec![FakeProduct::new(
            "ubuntu",
            "amd64/generic",
            "focal",
            "20240101",
        )
        .with_item("squashfs", b"first build")]),
    );
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let ctx = import_context(
        db.clone(),
        FakeMirror::new(vec![FakeProduct::new(
            "ubuntu",
            "amd64/generic",
            "focal",
            "20240202",
        )
        .with_item("squashfs", b"second build")]),
    );
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    let resource = &db.resources(Some(ResourceKind::Synced))[0];
    let sets = db.sets_of(resource.id);
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].version, "20240202");
    assert!(db
        .find_largefile_by_sha256(&sha256_hex(b"first build"))
        .is_none());
}

#[tokio::test]
async fn held_lock_skips_the_run_without_queueing() {
    let db = db();
    let ctx = import_context(
        db.clone(),
        FakeMirror::new(vec![FakeProduct::new(
            "ubuntu",
            "amd64/generic",
            "focal",
            "20240101",
        )
        .with_item("squashfs", b"bytes")]),
    );
    let guard = db.try_lock(IMPORT_IMAGES_LOCK).unwrap();
    assert_eq!(run(&ctx).await, ImportOutcome::Skipped);
    assert!(db.resources(None).is_empty());
    drop(guard);
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);
}

#[tokio::test]
async fn defaults_are_seeded_from_first_commissioning_resource() {
    let db = db();
    let ctx = import_context(
        db.clone(),
        FakeMirror::new(vec![
            FakeProduct::new("ubuntu", "amd64/generic", "jammy", "20240101")
                .with_item("squashfs", b"jammy bytes"),
            FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101")
                .with_item("squashfs", b"focal bytes"),
        ]),
    );
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    assert_eq!(
        db.get_config(config_keys::COMMISSIONING_OSYSTEM).as_deref(),
        Some("ubuntu")
    );
    assert_eq!(
        db.get_config(config_keys::COMMISSIONING_DISTRO_SERIES)
            .as_deref(),
        Some("focal")
    );
    assert_eq!(
        db.get_config(config_keys::DEFAULT_DISTRO_SERIES).as_deref(),
        Some("focal")
    );
}

#[tokio::test]
async fn defaults_chosen_by_operator_are_left_alone() {
    let db = db();
    db.set_config(config_keys::COMMISSIONING_DISTRO_SERIES, "noble");
    db.set_config(config_keys::DEFAULT_DISTRO_SERIES, "noble");
    let ctx = import_context(
        db.clone(),
        FakeMirror::new(vec![FakeProduct::new(
            "ubuntu",
            "amd64/generic",
            "focal",
            "20240101",
        )
        .with_item("squashfs", b"focal bytes")]),
    );
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);

    assert_eq!(
        db.get_config(config_keys::COMMISSIONING_DISTRO_SERIES)
            .as_deref(),
        Some("noble")
    );
}

#[tokio::test]
async fn upstream_read_failure_leaves_partial_state_for_next_run() {
    let db = db();
    let mut mirror = FakeMirror::new(vec![FakeProduct::new(
        "ubuntu",
        "amd64/generic",
        "focal",
        "20240101",
    )
    .with_item("squashfs", b"eventually good bytes")]);
    mirror.fail_content = true;
    let ctx = import_context(db.clone(), mirror.clone());
    // The run still finalizes: the failed payload write is absorbed, the
    // incomplete set reclaimed, and nothing is published.
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);
    assert!(published_products(&db).is_empty());

    mirror.fail_content = false;
    let ctx = import_context(db.clone(), mirror);
    assert_eq!(run(&ctx).await, ImportOutcome::Finalized);
    assert_eq!(published_products(&db).len(), 1);
}

#[tokio::test]
async fn fan_out_fires_only_after_a_finalized_run() {
    let db = db();
    db.add_boot_source(fake_boot_source());
    let rack_importer = Arc::new(RecordingRackImporter::default());
    let ctx = Arc::new(ImportContext {
        db: Arc::new(db.clone()),
        factory: Arc::new(FakeReaderFactory::single(FakeMirror::new(vec![
            FakeProduct::new("ubuntu", "amd64/generic", "focal", "20240101")
                .with_item("squashfs", b"bytes"),
        ]))),
        rack_importer: Arc::clone(&rack_importer) as Arc<dyn bootstream::rack::RackImporter>,
        config: test_config(),
    });

    import_resources(Arc::clone(&ctx));
    for _ in 0..200 {
        if rack_importer.runs() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(rack_importer.runs(), 1);

    // A skipped run (lock already held) must not fan out.
    let guard = db.try_lock(IMPORT_IMAGES_LOCK).unwrap();
    import_resources(Arc::clone(&ctx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(rack_importer.runs(), 1);
    drop(guard);
}

#[tokio::test]
async fn pipeline_safety_gate_requires_overlap_or_queued_writes() {
    let db = db();
    db.create_resource(
        ResourceKind::Synced,
        "ubuntu/focal",
        "amd64/generic",
        Extra::new(),
    );
    let importer = ResourceImporter::new(Arc::new(db.clone()), 2);
    assert_eq!(importer.queued_writes(), 0);
    let outcome = importer.finalize().await.unwrap();
    assert_eq!(outcome, FinalizeOutcome::Aborted);
    assert_eq!(db.resources(None).len(), 1);
}
