use blob_ingest::services::scanner::{ClamAvScanner, ContentScanner};

#[tokio::test]
#[ignore]
async fn test_clamav_connection_and_scan() {
    // 1. Setup Scanner checking localhost:3310
    let scanner = ClamAvScanner::new("127.0.0.1".to_string(), 3310);

    // 2. Health Check
    assert!(scanner.health_check().await, "ClamAV should be reachable");

    let dir = tempfile::tempdir().unwrap();

    // 3. Scan Clean Data
    let clean = dir.path().join("clean.txt");
    tokio::fs::write(&clean, b"Hello, this is a clean file.").await.unwrap();
    let verdict = scanner.scan(&clean).await.expect("Scan failed");
    assert!(verdict.clean, "Expected clean result, got {:?}", verdict);

    // 4. Scan Infected Data (EICAR)
    let eicar = dir.path().join("eicar.com");
    tokio::fs::write(
        &eicar,
        b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*",
    )
    .await
    .unwrap();
    let verdict = scanner.scan(&eicar).await.expect("Scan failed");
    assert!(!verdict.clean, "Expected infected result for EICAR");
    let detail = verdict.detail.unwrap_or_default();
    println!("Detected virus: {}", detail);
    assert!(
        detail.contains("Eicar") || detail.contains("EICAR"),
        "Should detect Eicar"
    );
}
