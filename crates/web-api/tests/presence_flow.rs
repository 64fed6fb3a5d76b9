mod support;

use domain::{ConversationId, UserId};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use support::{eventually, expect_event, send_json, spawn_server};

#[tokio::test]
async fn presence_endpoints_follow_websocket_sessions() {
    let server = spawn_server(&[]).await;
    let client = Client::new();
    let alice_id = UserId::random();
    let viewer_token = server.token(UserId::random(), "viewer");
    let (client, server, viewer_token) = (&client, &server, &viewer_token);

    // 从未上线的用户
    let unknown: Value = client
        .get(server.http(&format!("/api/v1/presence/{alice_id}")))
        .bearer_auth(viewer_token)
        .send()
        .await
        .expect("presence request")
        .json()
        .await
        .expect("presence json");
    assert_eq!(unknown["status"], "offline");
    assert!(unknown["lastSeenAt"].is_null());

    let mut alice = server.connect(alice_id, "alice").await;
    expect_event(&mut alice, "session.ready", |_| true).await;

    eventually("alice online via REST", || async move {
        let body: Value = client
            .get(server.http(&format!("/api/v1/presence/{alice_id}")))
            .bearer_auth(viewer_token)
            .send()
            .await
            .expect("presence request")
            .json()
            .await
            .expect("presence json");
        body["status"] == "online" && body["lastSeenAt"].is_string()
    })
    .await;

    let offline_id = UserId::random();
    let bulk: Value = client
        .post(server.http("/api/v1/presence/bulk"))
        .bearer_auth(viewer_token)
        .json(&json!({ "userIds": [alice_id, offline_id] }))
        .send()
        .await
        .expect("bulk request")
        .json()
        .await
        .expect("bulk json");
    assert_eq!(bulk["statuses"][alice_id.to_string()], "online");
    assert_eq!(bulk["statuses"][offline_id.to_string()], "offline");

    let stats: Value = client
        .get(server.http("/api/v1/stats"))
        .send()
        .await
        .expect("stats request")
        .json()
        .await
        .expect("stats json");
    assert_eq!(stats["activeConnections"], 1);
    assert_eq!(stats["onlineUsers"], 1);

    alice.close(None).await.expect("close");
    eventually("alice offline via REST", || async move {
        let body: Value = client
            .get(server.http(&format!("/api/v1/presence/{alice_id}")))
            .bearer_auth(viewer_token)
            .send()
            .await
            .expect("presence request")
            .json()
            .await
            .expect("presence json");
        // 离线后保留最后在线时间
        body["status"] == "offline" && body["lastSeenAt"].is_string()
    })
    .await;
}

#[tokio::test]
async fn typing_endpoint_lists_active_typists() {
    let server = spawn_server(&[]).await;
    let client = Client::new();
    let conversation = ConversationId::random();
    let alice_id = UserId::random();
    server
        .directory
        .set_participants(conversation, vec![alice_id, UserId::random()])
        .await;
    let token = server.token(alice_id, "alice");
    let (client, token) = (&client, &token);

    let mut alice = server.connect(alice_id, "alice").await;
    expect_event(&mut alice, "session.ready", |_| true).await;
    send_json(
        &mut alice,
        json!({ "type": "typing.start", "payload": { "conversationId": conversation } }),
    )
    .await;

    let url = server.http(&format!("/api/v1/conversations/{conversation}/typing"));
    let url = &url;
    eventually("alice listed as typing", || async move {
        let body: Value = client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .expect("typing request")
            .json()
            .await
            .expect("typing json");
        body["userIds"] == json!([alice_id])
    })
    .await;

    send_json(
        &mut alice,
        json!({ "type": "typing.stop", "payload": { "conversationId": conversation } }),
    )
    .await;
    eventually("typing cleared", || async move {
        let body: Value = client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .expect("typing request")
            .json()
            .await
            .expect("typing json");
        body["userIds"] == json!([])
    })
    .await;
}

#[tokio::test]
async fn presence_queries_require_authentication() {
    let server = spawn_server(&[]).await;
    let client = Client::new();

    let response = client
        .get(server.http(&format!("/api/v1/presence/{}", UserId::random())))
        .send()
        .await
        .expect("presence request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.expect("error json");
    assert_eq!(body["code"], "UNAUTHORIZED");

    let response = client
        .post(server.http("/api/v1/presence/bulk"))
        .bearer_auth(server.token(UserId::random(), "viewer"))
        .json(&json!({ "userIds": vec![UserId::random(); 501] }))
        .send()
        .await
        .expect("bulk request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_check_is_public() {
    let server = spawn_server(&[]).await;
    let body = Client::new()
        .get(server.http("/health"))
        .send()
        .await
        .expect("health request")
        .text()
        .await
        .expect("health body");
    assert_eq!(body, "ok");
}
