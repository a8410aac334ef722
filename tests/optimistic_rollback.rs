//! Failure-injection flows: after any operation settles, successfully or
//! not, the in-memory model must match what the store would serve on a
//! fresh fetch.

use std::sync::Arc;

use studio_core::controller::{Confirmation, StudioController};
use studio_core::model::{AspectRatio, GenerationOptions, User, UserId};
use studio_core::services::testing::{FakeImageService, FakeProjectStore};
use studio_core::services::{ProviderError, StoreError};
use studio_core::{ErrorKind, DEFAULT_FIRST_PROJECT_NAME};

fn user() -> User {
    User {
        id: UserId::new("u-1"),
        username: "ada".into(),
        email: "ada@example.com".into(),
        photo_url: String::new(),
    }
}

async fn harness() -> (StudioController, Arc<FakeImageService>, Arc<FakeProjectStore>) {
    let images = Arc::new(FakeImageService::new());
    let store = Arc::new(FakeProjectStore::new());
    let mut controller = StudioController::new(user(), images.clone(), store.clone());
    controller.hydrate().await.unwrap();
    (controller, images, store)
}

fn assert_converged(controller: &StudioController, store: &FakeProjectStore) {
    assert_eq!(
        store.projects_for(controller.user()),
        controller.model().projects,
        "memory and store diverged"
    );
}

#[tokio::test]
async fn model_and_store_agree_through_mixed_failures() {
    let (mut controller, images, store) = harness().await;

    let ids = controller
        .generate("fox", AspectRatio::Square, 3, GenerationOptions::default())
        .await
        .unwrap();
    assert_converged(&controller, &store);

    // Provider refusal: nothing inserted anywhere.
    images.fail_next(ProviderError::Unavailable("503".into()));
    controller
        .generate("fox", AspectRatio::Square, 1, GenerationOptions::default())
        .await
        .unwrap_err();
    assert_converged(&controller, &store);

    // Rejected insert: nothing inserted anywhere.
    store.fail_op("insert_images", StoreError::QuotaExceeded);
    controller
        .generate("fox", AspectRatio::Square, 1, GenerationOptions::default())
        .await
        .unwrap_err();
    assert_converged(&controller, &store);

    // Rejected favorite flip: reverted.
    store.fail_op("update_image", StoreError::Connection("down".into()));
    controller.toggle_favorite(&ids[0]).await.unwrap_err();
    assert!(!controller.model().find_image(&ids[0]).unwrap().favorite);
    assert_converged(&controller, &store);

    // Rejected delete: snapshot restored.
    store.fail_op("delete_image", StoreError::Connection("down".into()));
    controller.delete_image(&ids[1]).await.unwrap_err();
    assert!(controller.model().find_image(&ids[1]).is_some());
    assert_converged(&controller, &store);

    // And the successful retries land.
    controller.toggle_favorite(&ids[0]).await.unwrap();
    controller.delete_image(&ids[1]).await.unwrap();
    assert!(controller.model().find_image(&ids[1]).is_none());
    assert_converged(&controller, &store);
}

#[tokio::test]
async fn rejected_project_deletion_restores_the_full_list() {
    let (mut controller, _, store) = harness().await;
    controller
        .generate("fox", AspectRatio::Square, 1, GenerationOptions::default())
        .await
        .unwrap();
    let second = controller.create_project(false).await.unwrap();
    let before = controller.model().projects.clone();

    store.fail_op("delete_project", StoreError::PermissionDenied("policy".into()));
    let err = controller
        .delete_project(&second.id, Confirmation::Confirmed)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permission);

    assert_eq!(controller.model().projects, before);
    assert_converged(&controller, &store);
}

#[tokio::test]
async fn rejected_synthesized_project_surfaces_the_error() {
    let (mut controller, _, store) = harness().await;
    let ids = controller
        .generate("fox", AspectRatio::Square, 1, GenerationOptions::default())
        .await
        .unwrap();

    // The image delete and the project cleanup go through, but synthesizing
    // the replacement default project is refused.
    store.fail_op("insert_project", StoreError::QuotaExceeded);
    let err = controller.delete_image(&ids[0]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Storage);
    assert_converged(&controller, &store);
}

#[tokio::test]
async fn auto_name_rollback_keeps_both_sides_on_the_default_name() {
    let (mut controller, _, store) = harness().await;
    store.fail_op("rename_project", StoreError::Connection("down".into()));

    controller
        .generate("a red fox", AspectRatio::Square, 1, GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(
        controller.model().projects[0].name,
        DEFAULT_FIRST_PROJECT_NAME
    );
    assert_converged(&controller, &store);
}
