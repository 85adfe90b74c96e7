use super::*;

async fn direct_chat_for_test(
    app: &axum::Router,
    session: &AuthResponse,
    target_user_id: &str,
) -> String {
    let (status, payload) = json_request(
        app,
        "POST",
        String::from("/api/chats/direct"),
        Some(&session.token),
        Some(json!({"user_id": target_user_id})),
    )
    .await;
    assert!(status == StatusCode::OK || status == StatusCode::CREATED);
    payload.unwrap()["chat_id"].as_str().unwrap().to_owned()
}

async fn send_message_for_test(
    app: &axum::Router,
    session: &AuthResponse,
    chat_id: &str,
    content: &str,
) -> String {
    let (status, payload) = json_request(
        app,
        "POST",
        format!("/api/chats/{chat_id}/messages"),
        Some(&session.token),
        Some(json!({"content": content})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    payload.unwrap()["message_id"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn direct_chats_are_found_or_created_per_user_pair() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.ch@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.ch@example.com", "Bob").await;
    let alice_id = user_id_from_me(&app, &alice).await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let first = direct_chat_for_test(&app, &alice, &bob_id).await;
    // The same pair resolves to the same chat from either side.
    let again = direct_chat_for_test(&app, &alice, &bob_id).await;
    let reverse = direct_chat_for_test(&app, &bob, &alice_id).await;
    assert_eq!(first, again);
    assert_eq!(first, reverse);

    let (status, payload) = json_request(
        &app,
        "GET",
        format!("/api/chats/{first}"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let chat = payload.unwrap();
    assert_eq!(chat["kind"], "direct");
    assert!(chat["event_id"].is_null());
    assert_eq!(chat["participants"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn direct_chats_reject_self_and_unknown_targets() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.ct@example.com", "Alice").await;
    let alice_id = user_id_from_me(&app, &alice).await;

    let (status, _) = json_request(
        &app,
        "POST",
        String::from("/api/chats/direct"),
        Some(&alice.token),
        Some(json!({"user_id": alice_id})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = json_request(
        &app,
        "POST",
        String::from("/api/chats/direct"),
        Some(&alice.token),
        Some(json!({"user_id": meetpoint_core::UserId::new().to_string()})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn only_members_may_read_or_post() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.m@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.m@example.com", "Bob").await;
    let mallory = register_and_login_as(&app, "mallory.m@example.com", "Mallory").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;

    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/chats/{chat_id}/messages"),
        Some(&mallory.token),
        Some(json!({"content": "let me in"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages"),
        Some(&mallory.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn message_content_is_validated() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.mc@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.mc@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;

    for content in [String::from("   "), "x".repeat(2001)] {
        let (status, _) = json_request(
            &app,
            "POST",
            format!("/api/chats/{chat_id}/messages"),
            Some(&alice.token),
            Some(json!({"content": content})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn unread_counts_track_the_read_watermark() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.un@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.un@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;

    send_message_for_test(&app, &alice, &chat_id, "first").await;
    send_message_for_test(&app, &alice, &chat_id, "second").await;

    // Everything unauthored by Bob counts before he has ever read the chat.
    let (_, bob_chats) = json_request(
        &app,
        "GET",
        String::from("/api/chats"),
        Some(&bob.token),
        None,
    )
    .await;
    let bob_chats = bob_chats.unwrap();
    assert_eq!(bob_chats["chats"][0]["unread_count"], 2);

    // The author's own messages never count as unread.
    let (_, alice_chats) = json_request(
        &app,
        "GET",
        String::from("/api/chats"),
        Some(&alice.token),
        None,
    )
    .await;
    let alice_chats = alice_chats.unwrap();
    assert_eq!(alice_chats["chats"][0]["unread_count"], 0);

    // Listing the history moves Bob's watermark.
    let (status, payload) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["messages"].as_array().unwrap().len(), 2);

    let (_, bob_chats) = json_request(
        &app,
        "GET",
        String::from("/api/chats"),
        Some(&bob.token),
        None,
    )
    .await;
    let bob_chats = bob_chats.unwrap();
    assert_eq!(bob_chats["chats"][0]["unread_count"], 0);
}

#[tokio::test]
async fn rapid_sends_keep_creation_order() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.or@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.or@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;

    // Well inside one millisecond tick for several sends; the ids must still
    // sort in send order because they double as paging cursors.
    let mut sent_ids = Vec::new();
    for n in 0..10 {
        sent_ids.push(send_message_for_test(&app, &alice, &chat_id, &format!("burst {n}")).await);
    }

    let (status, payload) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages?limit=50"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payload = payload.unwrap();
    let messages = payload["messages"].as_array().unwrap();
    let listed_ids: Vec<String> = messages
        .iter()
        .map(|message| message["message_id"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(listed_ids, sent_ids);
    for (n, message) in messages.iter().enumerate() {
        assert_eq!(message["content"], format!("burst {n}"));
    }
}

#[tokio::test]
async fn history_pages_backwards_from_a_cursor() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.pg@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.pg@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;

    for n in 0..5 {
        send_message_for_test(&app, &alice, &chat_id, &format!("message {n}")).await;
    }

    let (_, newest) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages?limit=2"),
        Some(&alice.token),
        None,
    )
    .await;
    let newest = newest.unwrap();
    let newest = newest["messages"].as_array().unwrap().clone();
    assert_eq!(newest.len(), 2);
    assert_eq!(newest[0]["content"], "message 3");
    assert_eq!(newest[1]["content"], "message 4");

    let cursor = newest[0]["message_id"].as_str().unwrap();
    let (_, older) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages?limit=2&before={cursor}"),
        Some(&alice.token),
        None,
    )
    .await;
    let older = older.unwrap();
    let older = older["messages"].as_array().unwrap().clone();
    assert_eq!(older.len(), 2);
    assert_eq!(older[0]["content"], "message 1");
    assert_eq!(older[1]["content"], "message 2");
}

#[tokio::test]
async fn editing_is_restricted_to_the_author() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.ed@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.ed@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;
    let message_id = send_message_for_test(&app, &alice, &chat_id, "draft").await;

    let (status, _) = json_request(
        &app,
        "PATCH",
        format!("/api/chats/{chat_id}/messages/{message_id}"),
        Some(&bob.token),
        Some(json!({"content": "hijacked"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, payload) = json_request(
        &app,
        "PATCH",
        format!("/api/chats/{chat_id}/messages/{message_id}"),
        Some(&alice.token),
        Some(json!({"content": "final"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let edited = payload.unwrap();
    assert_eq!(edited["content"], "final");
    assert!(edited["edited_at_unix"].is_i64());
}

#[tokio::test]
async fn deleted_messages_keep_their_slot_but_lose_their_content() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.del@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.del@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;
    let message_id = send_message_for_test(&app, &alice, &chat_id, "oops").await;

    // Only the author may delete.
    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/chats/{chat_id}/messages/{message_id}"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/chats/{chat_id}/messages/{message_id}"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, payload) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages"),
        Some(&alice.token),
        None,
    )
    .await;
    let payload = payload.unwrap();
    let messages = payload["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["is_deleted"], true);
    assert_eq!(messages[0]["content"], "");

    // The deleted message still counts toward Bob's unread watermark.
    let (_, bob_chats) = json_request(
        &app,
        "GET",
        String::from("/api/chats"),
        Some(&bob.token),
        None,
    )
    .await;
    let bob_chats = bob_chats.unwrap();
    assert_eq!(bob_chats["chats"][0]["unread_count"], 1);

    // A deleted message can no longer be edited.
    let (status, _) = json_request(
        &app,
        "PATCH",
        format!("/api/chats/{chat_id}/messages/{message_id}"),
        Some(&alice.token),
        Some(json!({"content": "resurrected"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn polling_returns_backlog_immediately_and_times_out_empty() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.po@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.po@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let chat_id = direct_chat_for_test(&app, &alice, &bob_id).await;
    send_message_for_test(&app, &alice, &chat_id, "backlog").await;

    let (status, payload) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages/poll?after_unix=0&timeout_secs=5"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payload = payload.unwrap();
    let messages = payload["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "backlog");

    // Nothing new within the window yields an empty list.
    let far_future = 4_102_444_800_i64;
    let (status, payload) = json_request(
        &app,
        "GET",
        format!("/api/chats/{chat_id}/messages/poll?after_unix={far_future}&timeout_secs=1"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(payload.unwrap()["messages"].as_array().unwrap().is_empty());
}
