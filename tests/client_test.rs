//! Tests for DriveService and GoogleIdentityProvider with mocked HTTP responses.

use std::time::{SystemTime, UNIX_EPOCH};

use drive_facade::auth::{AuthorizationResponse, Credential, GoogleIdentityProvider, IdentityProvider};
use drive_facade::client::{DriveService, StorageApi, Upload};
use drive_facade::config::DriveConfig;
use drive_facade::models::{Account, NewEntry, FOLDER_MIME_TYPE};
use drive_facade::DriveError;
use jsonwebtoken::{encode, EncodingKey, Header};
use mockito::{Matcher, Server};
use serde_json::json;

const CLIENT_ID: &str = "test-client.apps.googleusercontent.com";

fn account() -> Account {
    Account {
        subject: "1234".to_string(),
        email: "doctor@example.com".to_string(),
    }
}

fn service(server: &Server) -> DriveService {
    let config = DriveConfig::default().with_api_base(&server.url());
    let credential = Credential::with_access_token(account(), "test-token".to_string(), 3600);
    DriveService::new(&config, credential, reqwest::Client::new())
}

fn id_token(aud: &str, email: &str) -> String {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    let claims = json!({
        "iss": "https://accounts.google.com",
        "sub": "1234",
        "aud": aud,
        "exp": exp,
        "email": email,
        "email_verified": true
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test")).unwrap()
}

fn provider(server: &Server) -> GoogleIdentityProvider {
    let config = DriveConfig::default()
        .with_client_id(CLIENT_ID)
        .with_oauth_base(&server.url());
    GoogleIdentityProvider::new(config)
}

mod drive_service {
    use super::*;

    #[tokio::test]
    async fn test_create_folder() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/files")
            .match_query(Matcher::UrlEncoded("fields".into(), "id".into()))
            .match_header("authorization", "Bearer test-token")
            .match_body(Matcher::PartialJson(json!({
                "name": "Studies",
                "mimeType": FOLDER_MIME_TYPE
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "folder-1"}"#)
            .create_async()
            .await;

        let entry = service(&server)
            .create(NewEntry::folder("Studies"), None)
            .await
            .unwrap();

        assert_eq!(entry.id, "folder-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_file_multipart() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/upload/files")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadType".into(), "multipart".into()),
                Matcher::UrlEncoded("fields".into(), "id".into()),
            ]))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""name":"scan\.dcm""#.into()),
                Matcher::Regex(r#""parents":\["folder-1"\]"#.into()),
                Matcher::Regex("DICM-payload".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "file-1"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scan.dcm"), b"DICM-payload").unwrap();
        let upload = Upload::open(dir.path(), "scan.dcm").await.unwrap();

        let entry = service(&server)
            .create(NewEntry::file("scan.dcm").in_folder("folder-1"), Some(upload))
            .await
            .unwrap();

        assert_eq!(entry.id, "file-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_parents() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/files/file-1")
            .match_query(Matcher::UrlEncoded("fields".into(), "parents".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"parents": ["A", "B"]}"#)
            .create_async()
            .await;

        let parents = service(&server).get_parents("file-1").await.unwrap();

        assert_eq!(parents, vec!["A", "B"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_parents_joins_removals() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/files/file-1")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("addParents".into(), "C".into()),
                Matcher::UrlEncoded("removeParents".into(), "A,B".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "file-1", "parents": ["C"]}"#)
            .create_async()
            .await;

        let entry = service(&server)
            .update_parents("file-1", "C", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();

        assert_eq!(entry.id, "file-1");
        assert_eq!(entry.parents, vec!["C"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_parents_without_removals_omits_parameter() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/files/file-1")
            .match_query(Matcher::Regex("^addParents=C&fields=[^&]*$".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "file-1", "parents": ["C"]}"#)
            .create_async()
            .await;

        let entry = service(&server)
            .update_parents("file-1", "C", &[])
            .await
            .unwrap();

        assert_eq!(entry.parents, vec!["C"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_page_sends_query_and_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/files")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "mimeType='application/dicom'".into()),
                Matcher::UrlEncoded("spaces".into(), "drive".into()),
                Matcher::UrlEncoded("pageToken".into(), "page-2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "files": [{"id": "f3", "name": "c.dcm", "mimeType": "application/dicom"}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let page = service(&server)
            .list_page("mimeType='application/dicom'", Some("page-2"))
            .await
            .unwrap();

        assert_eq!(page.files.len(), 1);
        assert!(page.next_page_token.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_uses_google_body() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/files/missing")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": {"code": 404, "message": "File not found: missing."}}"#)
            .create_async()
            .await;

        let err = service(&server).get_parents("missing").await.unwrap_err();

        match err {
            DriveError::ApiError { status, message } => {
                assert_eq!(status, 404);
                assert!(message.contains("File not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_api_error_with_plain_body_is_transient() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/files")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("backend unavailable")
            .create_async()
            .await;

        let err = service(&server)
            .create(NewEntry::folder("Studies"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, DriveError::ApiError { status: 503, .. }));
        assert!(err.is_transient());
    }
}

mod identity {
    use super::*;

    #[tokio::test]
    async fn test_complete_sign_in_exchanges_code() {
        let mut server = Server::new_async().await;
        let provider = provider(&server);
        let request = provider.sign_in_request().unwrap();

        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("client_id".into(), CLIENT_ID.into()),
                Matcher::UrlEncoded(
                    "code_verifier".into(),
                    request.verifier().verifier().into(),
                ),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "access-1",
                    "refresh_token": "refresh-1",
                    "expires_in": 3600,
                    "id_token": id_token(CLIENT_ID, "doctor@example.com")
                })
                .to_string(),
            )
            .create_async()
            .await;

        let response = AuthorizationResponse {
            code: Some("auth-code".into()),
            state: Some(request.verifier().state().to_string()),
            ..Default::default()
        };
        let credential = provider.complete_sign_in(&request, &response).await.unwrap();

        assert_eq!(credential.account().email, "doctor@example.com");
        assert_eq!(credential.refresh_token(), Some("refresh-1"));
        assert_eq!(credential.access_token().await.unwrap(), "access-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_state_mismatch_is_rejected() {
        let server = Server::new_async().await;
        let provider = provider(&server);
        let request = provider.sign_in_request().unwrap();

        let response = AuthorizationResponse {
            code: Some("auth-code".into()),
            state: Some("forged".into()),
            ..Default::default()
        };
        let err = provider.complete_sign_in(&request, &response).await.unwrap_err();

        assert!(matches!(err, DriveError::StateMismatch { .. }));
    }

    #[tokio::test]
    async fn test_denied_consent_is_sign_in_failure() {
        let server = Server::new_async().await;
        let provider = provider(&server);
        let request = provider.sign_in_request().unwrap();

        let response = AuthorizationResponse {
            error: Some("access_denied".into()),
            state: Some(request.verifier().state().to_string()),
            ..Default::default()
        };
        let err = provider.complete_sign_in(&request, &response).await.unwrap_err();

        assert!(matches!(err, DriveError::SignInFailed(ref m) if m.contains("access_denied")));
    }

    #[tokio::test]
    async fn test_id_token_for_other_client_is_rejected() {
        let mut server = Server::new_async().await;
        let provider = provider(&server);
        let request = provider.sign_in_request().unwrap();

        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "access-1",
                    "expires_in": 3600,
                    "id_token": id_token("someone-else", "doctor@example.com")
                })
                .to_string(),
            )
            .create_async()
            .await;

        let response = AuthorizationResponse {
            code: Some("auth-code".into()),
            state: Some(request.verifier().state().to_string()),
            ..Default::default()
        };
        let err = provider.complete_sign_in(&request, &response).await.unwrap_err();

        assert!(matches!(err, DriveError::IdToken(_)));
    }

    #[tokio::test]
    async fn test_invalid_grant_is_token_exchange_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": "invalid_grant", "error_description": "Token has been expired or revoked."}"#)
            .create_async()
            .await;

        let err = provider(&server).restore("stale-refresh").await.unwrap_err();

        assert!(matches!(err, DriveError::TokenExchange(ref m) if m.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_restore_keeps_refresh_token() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "access-2",
                    "expires_in": 3600,
                    "id_token": id_token(CLIENT_ID, "doctor@example.com")
                })
                .to_string(),
            )
            .create_async()
            .await;

        let credential = provider(&server).restore("refresh-1").await.unwrap();

        assert_eq!(credential.account().email, "doctor@example.com");
        assert_eq!(credential.refresh_token(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_sign_out_revokes_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "access-1".into()))
            .with_status(200)
            .create_async()
            .await;

        let credential = Credential::with_access_token(account(), "access-1".into(), 3600);
        provider(&server).sign_out(Some(&credential)).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sign_out_without_credential_makes_no_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/revoke")
            .expect(0)
            .create_async()
            .await;

        provider(&server).sign_out(None).await.unwrap();

        mock.assert_async().await;
    }
}
