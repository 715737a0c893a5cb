//! API integration tests.
//!
//! Tests verify:
//! - Upload validation and record creation
//! - Transform request validation (nothing enqueued on rejection)
//! - Image lookup, ownership and listing
//! - Authentication and HTTP error shapes

use axum::body::Body;
use axum::http::{header, Request};
use serde_json::json;

use imgflow::queue::JobQueue;

use super::test_utils::{
    get_request, png_bytes, transform_request, upload_request, upload_request_with_field, TestApp,
};

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_is_public() {
    let app = TestApp::new();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, body) = app.send(request).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_image_routes_live_under_api_prefix() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, _) = app.send(get_request(&token, "/api/images")).await;
    assert_eq!(status, 200);

    let (status, _) = app.send(get_request(&token, "/images")).await;
    assert_eq!(status, 404);
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = TestApp::new();
    let request = Request::builder().uri("/api/images").body(Body::empty()).unwrap();

    let (status, body) = app.send(request).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "missing_token");
}

#[tokio::test]
async fn test_forged_token_is_unauthorized() {
    let app = TestApp::new();
    let forged = imgflow::TokenAuth::new("other-secret").sign("alice", std::time::Duration::from_secs(60));

    let (status, body) = app.send(get_request(&forged, "/api/images")).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "invalid_signature");
}

#[tokio::test]
async fn test_non_bearer_scheme_is_unauthorized() {
    let app = TestApp::new();
    let request = Request::builder()
        .uri("/api/images")
        .header(header::AUTHORIZATION, "Basic YWxpY2U6cHc=")
        .body(Body::empty())
        .unwrap();

    let (status, _) = app.send(request).await;
    assert_eq!(status, 401);
}

// =============================================================================
// Upload
// =============================================================================

#[tokio::test]
async fn test_upload_creates_record() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, body) = app
        .send(upload_request(&token, "cat.png", "image/png", &png_bytes(16, 16)))
        .await;

    assert_eq!(status, 201);
    assert_eq!(body["ownerId"], "alice");
    assert_eq!(body["metadata"]["filename"], "cat.png");
    assert_eq!(body["metadata"]["mimeType"], "image/png");
    assert_eq!(body["variants"], json!([]));
    assert!(body["originalLocation"]
        .as_str()
        .unwrap()
        .starts_with("mem://objects/images/"));
    assert_eq!(app.objects.len().await, 1);
}

#[tokio::test]
async fn test_upload_without_file_field() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, body) = app
        .send(upload_request_with_field(
            &token,
            "attachment",
            "cat.png",
            "image/png",
            &png_bytes(4, 4),
        ))
        .await;

    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_upload");
    assert_eq!(body["message"], "No image file provided");
}

#[tokio::test]
async fn test_upload_rejects_disallowed_type() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, body) = app
        .send(upload_request(&token, "doc.pdf", "application/pdf", b"%PDF-1.4"))
        .await;

    assert_eq!(status, 400);
    assert!(body["message"].as_str().unwrap().contains("Unsupported file type"));
    assert!(app.objects.is_empty().await);
}

#[tokio::test]
async fn test_upload_rejects_undecodable_bytes() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, body) = app
        .send(upload_request(&token, "fake.png", "image/png", b"not really a png"))
        .await;

    assert_eq!(status, 400);
    assert!(body["message"].as_str().unwrap().contains("not a valid image"));
    assert!(app.records.is_empty().await);
}

#[tokio::test]
async fn test_upload_rejects_mislabeled_content() {
    let app = TestApp::new();
    let token = app.token("alice");

    let mut bmp = Vec::new();
    image::DynamicImage::new_rgb8(4, 4)
        .write_to(&mut std::io::Cursor::new(&mut bmp), image::ImageFormat::Bmp)
        .unwrap();

    let (status, body) = app
        .send(upload_request(&token, "photo.png", "image/png", &bmp))
        .await;

    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_upload");
    assert!(body["message"].as_str().unwrap().contains("image/bmp"));
    assert!(app.objects.is_empty().await);
    assert!(app.records.is_empty().await);
}

#[tokio::test]
async fn test_upload_rejects_oversized_file() {
    let app = TestApp::new();
    let token = app.token("alice");
    let oversized = vec![0u8; imgflow::service::DEFAULT_MAX_UPLOAD_BYTES + 1];

    let (status, _) = app
        .send(upload_request(&token, "big.png", "image/png", &oversized))
        .await;

    assert_eq!(status, 400);
    assert!(app.objects.is_empty().await);
}

// =============================================================================
// Transform Requests
// =============================================================================

#[tokio::test]
async fn test_transform_is_accepted_and_queued() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 32, 32).await;
    let token = app.token("alice");

    let (status, body) = app
        .send(transform_request(
            &token,
            &image_id,
            &json!({ "transformations": { "rotate": 90, "resize": { "width": 10 } } }),
        ))
        .await;

    assert_eq!(status, 202);
    assert_eq!(body["message"], "Transformation queued");
    assert_eq!(body["imageId"], image_id.as_str());
    assert!(body["jobId"].as_str().is_some());
    assert_eq!(body["transformations"]["rotate"]["degrees"], 90);
    assert_eq!(app.queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_transformation_is_rejected_without_enqueue() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 8, 8).await;
    let token = app.token("alice");

    let (status, body) = app
        .send(transform_request(
            &token,
            &image_id,
            &json!({ "transformations": { "foo": 1, "rotate": 90 } }),
        ))
        .await;

    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_transformations");
    assert_eq!(body["message"], "Invalid transformations: foo");
    assert!(app.queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_malformed_parameters_are_rejected() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 8, 8).await;
    let token = app.token("alice");

    for transformations in [
        json!({ "rotate": 45 }),
        json!({ "crop": { "x": 0, "y": 0, "width": 0, "height": 10 } }),
        json!({ "format": "svg" }),
        json!({ "compress": { "quality": 0 } }),
        json!({ "resize": {} }),
    ] {
        let (status, body) = app
            .send(transform_request(
                &token,
                &image_id,
                &json!({ "transformations": transformations }),
            ))
            .await;
        assert_eq!(status, 400, "{} -> {}", transformations, body);
    }
    assert!(app.queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_missing_transformations_body() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 8, 8).await;
    let token = app.token("alice");

    let (status, body) = app
        .send(transform_request(&token, &image_id, &json!({ "rotate": 90 })))
        .await;

    assert_eq!(status, 400);
    assert_eq!(body["message"], "Transformations required");
    assert!(app.queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_non_json_transform_body() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 8, 8).await;
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/images/{}/transform", image_id))
        .header(header::AUTHORIZATION, format!("Bearer {}", app.token("alice")))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, body) = app.send(request).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_transformations");
}

#[tokio::test]
async fn test_transform_on_missing_image_is_not_found() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, body) = app
        .send(transform_request(
            &token,
            "does-not-exist",
            &json!({ "transformations": { "flip": true } }),
        ))
        .await;

    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");
    assert!(app.queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_transform_on_someone_elses_image_is_not_found() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 8, 8).await;

    let (status, _) = app
        .send(transform_request(
            &app.token("bob"),
            &image_id,
            &json!({ "transformations": { "flip": true } }),
        ))
        .await;

    assert_eq!(status, 404);
    assert!(app.queue.is_empty().await.unwrap());
}

// =============================================================================
// Lookup and Listing
// =============================================================================

#[tokio::test]
async fn test_get_image_checks_owner_even_when_cached() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 8, 8).await;
    let uri = format!("/api/images/{}", image_id);

    let (status, body) = app.send(get_request(&app.token("alice"), &uri)).await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], image_id.as_str());
    assert!(app.cache.get(&imgflow::image_key(&image_id)).await.is_some());

    let (status, _) = app.send(get_request(&app.token("bob"), &uri)).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_get_missing_image() {
    let app = TestApp::new();
    let (status, body) = app
        .send(get_request(&app.token("alice"), "/api/images/nope"))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn test_list_images_paginates_newest_first() {
    let app = TestApp::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(app.upload_png("alice", 4, 4).await);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    app.upload_png("bob", 4, 4).await;

    let (status, body) = app
        .send(get_request(&app.token("alice"), "/api/images?page=1&limit=2"))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], 3);
    assert_eq!(body["totalPages"], 2);
    assert_eq!(body["currentPage"], 1);
    let page: Vec<&str> = body["images"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(page, vec![ids[2].as_str(), ids[1].as_str()]);

    let (_, body) = app
        .send(get_request(&app.token("alice"), "/api/images?page=2&limit=2"))
        .await;
    assert_eq!(body["images"].as_array().unwrap().len(), 1);
    assert_eq!(body["images"][0]["id"], ids[0].as_str());
}

#[tokio::test]
async fn test_list_images_defaults() {
    let app = TestApp::new();
    app.upload_png("alice", 4, 4).await;

    let (status, body) = app.send(get_request(&app.token("alice"), "/api/images")).await;
    assert_eq!(status, 200);
    assert_eq!(body["currentPage"], 1);
    assert_eq!(body["totalPages"], 1);
}
