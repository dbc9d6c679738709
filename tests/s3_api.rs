//! End-to-end HTTP tests against a real `jcache-s3store` process.

mod common;

use common::{generate_binary, TestServer};

#[tokio::test]
async fn bucket_lifecycle() {
    let server = TestServer::start().await;
    let client = server.client();
    let base = server.endpoint();

    let resp = client
        .put(format!("{base}/lifecycle-bucket"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .head(format!("{base}/lifecycle-bucket"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(&base).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("lifecycle-bucket"));

    let resp = client
        .delete(format!("{base}/lifecycle-bucket"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .head(format!("{base}/lifecycle-bucket"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn put_get_delete_round_trip() {
    let server = TestServer::start().await;
    let client = server.client();
    let base = server.endpoint();

    client
        .put(format!("{base}/round-trip"))
        .send()
        .await
        .unwrap();

    let payload = generate_binary(64 * 1024, 7);

    let resp = client
        .put(format!("{base}/round-trip/hello.bin"))
        .header("content-type", "application/octet-stream")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let etag = resp
        .headers()
        .get("etag")
        .expect("etag header")
        .to_str()
        .unwrap()
        .to_string();

    let resp = client
        .get(format!("{base}/round-trip/hello.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("etag").unwrap().to_str().unwrap(),
        etag
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.as_ref(), payload.as_slice());

    let resp = client
        .head(format!("{base}/round-trip/hello.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-length").unwrap().to_str().unwrap(),
        payload.len().to_string()
    );

    let resp = client
        .delete(format!("{base}/round-trip/hello.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .get(format!("{base}/round-trip/hello.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // delete is idempotent
    let resp = client
        .delete(format!("{base}/round-trip/hello.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn user_metadata_round_trips_through_headers() {
    let server = TestServer::start().await;
    let client = server.client();
    let base = server.endpoint();

    client.put(format!("{base}/meta-bucket")).send().await.unwrap();

    let resp = client
        .put(format!("{base}/meta-bucket/doc.txt"))
        .header("x-amz-meta-author", "test-suite")
        .body("hello world")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .head(format!("{base}/meta-bucket/doc.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("x-amz-meta-author")
            .unwrap()
            .to_str()
            .unwrap(),
        "test-suite"
    );
}

#[tokio::test]
async fn multipart_upload_lifecycle() {
    let server = TestServer::start().await;
    let client = server.client();
    let base = server.endpoint();

    client.put(format!("{base}/mpu-bucket")).send().await.unwrap();

    let resp = client
        .post(format!("{base}/mpu-bucket/big.bin?uploads"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let init_xml = resp.text().await.unwrap();
    let upload_id = extract_tag(&init_xml, "UploadId");

    let part1 = generate_binary(5 * 1024 * 1024, 1);
    let part2 = generate_binary(1024, 2);

    let resp = client
        .put(format!(
            "{base}/mpu-bucket/big.bin?partNumber=1&uploadId={upload_id}"
        ))
        .body(part1.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let etag1 = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let resp = client
        .put(format!(
            "{base}/mpu-bucket/big.bin?partNumber=2&uploadId={upload_id}"
        ))
        .body(part2.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let etag2 = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let complete_body = format!(
        "<CompleteMultipartUpload>\
           <Part><PartNumber>1</PartNumber><ETag>{etag1}</ETag></Part>\
           <Part><PartNumber>2</PartNumber><ETag>{etag2}</ETag></Part>\
         </CompleteMultipartUpload>"
    );

    let resp = client
        .post(format!("{base}/mpu-bucket/big.bin?uploadId={upload_id}"))
        .body(complete_body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{base}/mpu-bucket/big.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), part1.len() + part2.len());
    assert_eq!(&body[..part1.len()], part1.as_slice());
    assert_eq!(&body[part1.len()..], part2.as_slice());
}

#[tokio::test]
async fn abort_multipart_upload() {
    let server = TestServer::start().await;
    let client = server.client();
    let base = server.endpoint();

    client.put(format!("{base}/abort-bucket")).send().await.unwrap();

    let resp = client
        .post(format!("{base}/abort-bucket/partial.bin?uploads"))
        .send()
        .await
        .unwrap();
    let init_xml = resp.text().await.unwrap();
    let upload_id = extract_tag(&init_xml, "UploadId");

    client
        .put(format!(
            "{base}/abort-bucket/partial.bin?partNumber=1&uploadId={upload_id}"
        ))
        .body(generate_binary(1024, 3))
        .send()
        .await
        .unwrap();

    let resp = client
        .delete(format!(
            "{base}/abort-bucket/partial.bin?uploadId={upload_id}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .get(format!("{base}/abort-bucket/partial.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let server = TestServer::start().await;
    let client = server.client();
    let base = server.endpoint();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    client.put(format!("{base}/stats-bucket")).send().await.unwrap();
    client
        .put(format!("{base}/stats-bucket/x.bin"))
        .body(generate_binary(2048, 5))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{base}/stats?bucket=stats-bucket"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["total_objects"], 1);
    assert_eq!(stats["total_bytes"], 2048);
}

#[tokio::test]
async fn metrics_endpoint_exposes_http_counters() {
    let server = TestServer::start().await;
    let client = server.client();
    let base = server.endpoint();

    client.get(format!("{base}/health")).send().await.unwrap();

    let resp = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("http_requests_total"));
}

/// Pull the text content of the first `<Tag>...</Tag>` occurrence out of an
/// XML response body. Good enough for asserting on well-formed responses
/// this crate itself produced.
fn extract_tag(xml: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open).expect("tag not found") + open.len();
    let end = xml[start..].find(&close).expect("closing tag not found") + start;
    xml[start..end].to_string()
}
