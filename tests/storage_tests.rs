//! Storage contract tests against a live PostgreSQL with pgvector.
//! Run with `cargo test -- --ignored` when a database is available.

mod common;

use common::{cleanup_messages, init_test_db, make_message, test_id};
use mailmind::models::classification::Priority;
use mailmind::models::message::MailMessage;
use mailmind::queries::{chat, classifications, messages, metadata};
use mailmind::services::search;

#[tokio::test]
#[ignore]
async fn save_then_get_round_trips_payload() {
    let pool = init_test_db().await;
    let prefix = test_id("roundtrip");
    let id = format!("{}_m1", prefix);

    let mut msg = make_message(&id, "Round trip", "alice@example.com", 1_700_000_000_000);
    msg.payload = Some(serde_json::json!({
        "mimeType": "multipart/alternative",
        "parts": [
            {"mimeType": "text/plain", "body": {"data": "aGVsbG8"}},
            {"mimeType": "text/html", "filename": "", "headers": []}
        ]
    }));

    let mut conn = pool.acquire().await.unwrap();
    messages::save_message(&mut conn, &msg).await.unwrap();

    let loaded = messages::get_message_by_id(&mut conn, &id)
        .await
        .unwrap()
        .expect("message should exist");
    assert_eq!(loaded.payload, msg.payload);
    assert_eq!(loaded.subject, msg.subject);
    assert_eq!(loaded.internal_date, msg.internal_date);

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn upsert_is_last_write_wins() {
    let pool = init_test_db().await;
    let prefix = test_id("upsert");
    let id = format!("{}_m1", prefix);

    let mut conn = pool.acquire().await.unwrap();
    let first = make_message(&id, "Old subject", "a@x.com", 1);
    messages::save_message(&mut conn, &first).await.unwrap();

    let second = make_message(&id, "New subject", "a@x.com", 2);
    messages::save_message(&mut conn, &second).await.unwrap();

    let loaded = messages::get_message_by_id(&mut conn, &id).await.unwrap().unwrap();
    assert_eq!(loaded.subject.as_deref(), Some("New subject"));
    assert_eq!(loaded.internal_date, Some(2));

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn reclassification_advances_latest_pointer_and_grows_history() {
    let pool = init_test_db().await;
    let prefix = test_id("reclass");
    let id = format!("{}_m1", prefix);

    let mut conn = pool.acquire().await.unwrap();
    messages::save_message(&mut conn, &make_message(&id, "subject", "a@x.com", 1)).await.unwrap();
    drop(conn);

    let first = classifications::create_classification(
        &pool,
        &id,
        &["finance".to_string()],
        Priority::Normal,
        "first pass",
        Some("rules"),
    )
    .await
    .unwrap();

    let second = classifications::create_classification(
        &pool,
        &id,
        &["finance".to_string(), "bills".to_string()],
        Priority::High,
        "second pass",
        Some("rules"),
    )
    .await
    .unwrap();
    assert_ne!(first, second);

    let mut conn = pool.acquire().await.unwrap();
    let latest = classifications::get_latest(&mut conn, &id).await.unwrap().unwrap();
    assert_eq!(latest.id, second);
    assert_eq!(latest.message_id, id);

    let history = classifications::list_for_message(&mut conn, &id).await.unwrap();
    assert_eq!(history.len(), 2);
    // Newest first
    assert_eq!(history[0].id, second);

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn label_filters_use_and_semantics() {
    let pool = init_test_db().await;
    let prefix = test_id("labels");

    let mut conn = pool.acquire().await.unwrap();
    for (suffix, labels) in [
        ("a", vec!["finance".to_string(), "bills".to_string()]),
        ("b", vec!["finance".to_string()]),
        ("c", vec!["travel".to_string()]),
    ] {
        let id = format!("{}_{}", prefix, suffix);
        messages::save_message(&mut conn, &make_message(&id, suffix, "s@x.com", 1)).await.unwrap();
        classifications::create_classification(&pool, &id, &labels, Priority::Normal, "", None)
            .await
            .unwrap();
    }

    let filters = messages::MessageFilters {
        labels: Some(vec!["finance".to_string(), "bills".to_string()]),
        ..Default::default()
    };
    let (rows, total) = messages::list_messages_by_filters(&mut conn, &filters, 1000, 0)
        .await
        .unwrap();

    let matching: Vec<&MailMessage> =
        rows.iter().filter(|m| m.id.starts_with(&prefix)).collect();
    assert_eq!(matching.len(), 1);
    assert!(matching[0].id.ends_with("_a"));
    assert!(total >= 1);

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn priority_filter_is_case_insensitive() {
    let pool = init_test_db().await;
    let prefix = test_id("priority");
    let id = format!("{}_m1", prefix);

    let mut conn = pool.acquire().await.unwrap();
    messages::save_message(&mut conn, &make_message(&id, "s", "p@x.com", 1)).await.unwrap();
    classifications::create_classification(&pool, &id, &[], Priority::High, "", None)
        .await
        .unwrap();

    let (rows, _) = messages::list_messages_by_priority(&mut conn, "HIGH", 1000, 0)
        .await
        .unwrap();
    assert!(rows.iter().any(|m| m.id == id));

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn chunked_message_scores_by_best_chunk_and_dedupes() {
    let pool = init_test_db().await;
    let prefix = test_id("chunks");
    let id = format!("{}_m1", prefix);

    let mut conn = pool.acquire().await.unwrap();
    messages::save_message(&mut conn, &make_message(&id, "chunked", "c@x.com", 1)).await.unwrap();
    drop(conn);

    // Three chunks at different angles from the query vector
    let mut near = vec![0.0f32; 384];
    near[0] = 1.0;
    let mut mid = vec![0.0f32; 384];
    mid[0] = 0.7;
    mid[1] = 0.714_143; // unit-ish, cos ≈ 0.7 against e0
    let mut far = vec![0.0f32; 384];
    far[1] = 1.0;

    messages::save_chunks(
        &pool,
        &id,
        "stub-encoder",
        &[
            ("far chunk".to_string(), far),
            ("near chunk".to_string(), near.clone()),
            ("mid chunk".to_string(), mid),
        ],
    )
    .await
    .unwrap();

    let mut conn = pool.acquire().await.unwrap();

    // Invariant: either a row embedding or chunks, never both
    assert!(messages::get_message_embedding(&mut conn, &id).await.unwrap().is_none());
    let chunks = messages::get_chunks_for_message(&mut conn, &id).await.unwrap();
    assert_eq!(chunks.len(), 3);
    let indexes: Vec<i32> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);

    let results = messages::similarity_search(&mut conn, &near, 100, 0.0).await.unwrap();
    let ours: Vec<_> = results.iter().filter(|(m, _)| m.id == id).collect();
    assert_eq!(ours.len(), 1, "chunked message must appear exactly once");
    assert!(ours[0].1 > 0.99, "score must be the best chunk's similarity");

    // Sorted descending overall
    for pair in results.windows(2) {
        assert!(pair[0].1 >= pair[1].1);
    }

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn single_embedding_replaces_chunks() {
    let pool = init_test_db().await;
    let prefix = test_id("xor");
    let id = format!("{}_m1", prefix);

    let mut conn = pool.acquire().await.unwrap();
    messages::save_message(&mut conn, &make_message(&id, "xor", "x@x.com", 1)).await.unwrap();
    drop(conn);

    let mut v = vec![0.0f32; 384];
    v[3] = 1.0;

    messages::save_chunks(&pool, &id, "m", &[("c0".to_string(), v.clone())])
        .await
        .unwrap();
    messages::save_embedding(&pool, &id, &v, "m").await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    assert!(messages::get_message_embedding(&mut conn, &id).await.unwrap().is_some());
    assert!(messages::get_chunks_for_message(&mut conn, &id).await.unwrap().is_empty());

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn hybrid_search_obeys_rrf_ordering() {
    let pool = init_test_db().await;
    let prefix = test_id("hybrid");

    let mut conn = pool.acquire().await.unwrap();
    let mut e0 = vec![0.0f32; 384];
    e0[0] = 1.0;

    for (suffix, subject) in [
        ("a", "quarterly budget report attached"),
        ("b", "budget review meeting follow up"),
    ] {
        let id = format!("{}_{}", prefix, suffix);
        messages::save_message(
            &mut conn,
            &make_message(&id, subject, "fin@corp.com", 1_700_000_000_000),
        )
        .await
        .unwrap();
        messages::save_embedding(&pool, &id, &e0, "m").await.unwrap();
    }

    let results =
        search::hybrid_search(&mut conn, &e0, "budget report", 10, 50, 0.6, 0.4)
            .await
            .unwrap();

    let ours: Vec<_> = results.iter().filter(|(m, _)| m.id.starts_with(&prefix)).collect();
    assert_eq!(ours.len(), 2);
    for (_, score) in &ours {
        assert!(*score > 0.0);
    }

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn batch_save_and_batch_classify_are_atomic_units() {
    let pool = init_test_db().await;
    let prefix = test_id("batch");

    let batch: Vec<MailMessage> = (0..150)
        .map(|i| make_message(&format!("{}_m{}", prefix, i), "bulk", "bulk@x.com", i))
        .collect();
    messages::save_messages_batch(&pool, &batch).await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let ids = messages::get_message_ids(&mut conn).await.unwrap();
    let ours = ids.iter().filter(|id| id.starts_with(&prefix)).count();
    assert_eq!(ours, 150);

    // Saving the same batch again is an upsert, not a duplicate
    messages::save_messages_batch(&pool, &batch).await.unwrap();
    let ids = messages::get_message_ids(&mut conn).await.unwrap();
    assert_eq!(ids.iter().filter(|id| id.starts_with(&prefix)).count(), 150);
    drop(conn);

    let items: Vec<(String, Vec<String>, Priority, String, Option<String>)> = (0..150)
        .map(|i| {
            (
                format!("{}_m{}", prefix, i),
                vec!["work".to_string()],
                Priority::Normal,
                "bulk classified".to_string(),
                Some("rules".to_string()),
            )
        })
        .collect();
    let ids = classifications::create_classifications_batch(&pool, &items).await.unwrap();
    assert_eq!(ids.len(), 150);

    let mut conn = pool.acquire().await.unwrap();
    let unclassified = messages::get_unclassified_message_ids(&mut conn).await.unwrap();
    assert!(!unclassified.iter().any(|id| id.starts_with(&prefix)));

    let classified = messages::count_classified_messages(&mut conn).await.unwrap();
    assert!(classified >= 150);

    let counts = messages::get_label_counts(&mut conn).await.unwrap();
    let work = counts.iter().find(|(label, _)| label == "work").unwrap();
    assert!(work.1 >= 150);

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn classified_and_unclassified_partitions_are_disjoint() {
    let pool = init_test_db().await;
    let prefix = test_id("partition");

    let mut conn = pool.acquire().await.unwrap();
    let classified_id = format!("{}_yes", prefix);
    let unclassified_id = format!("{}_no", prefix);
    messages::save_message(&mut conn, &make_message(&classified_id, "a", "p@x.com", 1))
        .await
        .unwrap();
    messages::save_message(&mut conn, &make_message(&unclassified_id, "b", "p@x.com", 2))
        .await
        .unwrap();
    classifications::create_classification(&pool, &classified_id, &[], Priority::Low, "", None)
        .await
        .unwrap();

    let (classified, _) = messages::list_classified_messages(&mut conn, 10_000, 0).await.unwrap();
    let (unclassified, _) =
        messages::list_unclassified_messages(&mut conn, 10_000, 0).await.unwrap();

    assert!(classified.iter().any(|m| m.id == classified_id));
    assert!(!classified.iter().any(|m| m.id == unclassified_id));
    assert!(unclassified.iter().any(|m| m.id == unclassified_id));
    assert!(!unclassified.iter().any(|m| m.id == classified_id));

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn keyword_search_ranks_subject_hits_above_snippet_hits() {
    let pool = init_test_db().await;
    let prefix = test_id("fts");

    let mut conn = pool.acquire().await.unwrap();

    let subject_hit = format!("{}_subject", prefix);
    let mut m1 = make_message(&subject_hit, "quarterly zebra budget", "a@x.com", 1);
    m1.snippet = Some("nothing to see".to_string());
    messages::save_message(&mut conn, &m1).await.unwrap();

    let snippet_hit = format!("{}_snippet", prefix);
    let mut m2 = make_message(&snippet_hit, "weekly notes", "b@x.com", 2);
    m2.snippet = Some("the zebra budget came up briefly".to_string());
    messages::save_message(&mut conn, &m2).await.unwrap();

    let results = messages::keyword_search(&mut conn, "zebra budget", 50, 0.0).await.unwrap();
    let ours: Vec<&(MailMessage, f64)> = results
        .iter()
        .filter(|(m, _)| m.id.starts_with(&prefix))
        .collect();
    assert_eq!(ours.len(), 2);
    // Subject carries weight A, so the subject hit ranks first
    assert_eq!(ours[0].0.id, subject_hit);
    assert!(ours[0].1 >= ours[1].1);

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn unread_count_detects_provider_label() {
    let pool = init_test_db().await;
    let prefix = test_id("unread");

    let mut conn = pool.acquire().await.unwrap();
    let before = messages::get_unread_count(&mut conn).await.unwrap();

    let mut unread = make_message(&format!("{}_u", prefix), "s", "u@x.com", 1);
    unread.labels = Some(vec!["INBOX".to_string(), "UNREAD".to_string()]);
    messages::save_message(&mut conn, &unread).await.unwrap();

    let mut read = make_message(&format!("{}_r", prefix), "s", "u@x.com", 2);
    read.labels = Some(vec!["INBOX".to_string()]);
    messages::save_message(&mut conn, &read).await.unwrap();

    let after = messages::get_unread_count(&mut conn).await.unwrap();
    assert_eq!(after, before + 1);

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn history_id_second_write_wins() {
    let pool = init_test_db().await;
    let mut conn = pool.acquire().await.unwrap();

    metadata::set_history_id(&mut conn, "111").await.unwrap();
    metadata::set_history_id(&mut conn, "222").await.unwrap();
    assert_eq!(
        metadata::get_history_id(&mut conn).await.unwrap(),
        Some("222".to_string())
    );
}

#[tokio::test]
#[ignore]
async fn chat_session_lifecycle() {
    let pool = init_test_db().await;
    let mut conn = pool.acquire().await.unwrap();

    let session = chat::create_chat_session(&mut conn, None).await.unwrap();
    assert_eq!(session.title.as_deref(), Some("New Chat"));

    let before = chat::get_chat_session(&mut conn, session.id).await.unwrap().updated_at;

    chat::save_message_to_chat_session(
        &mut conn,
        session.id,
        mailmind::models::chat::ChatRole::User,
        "hello",
        None,
        None,
        None,
    )
    .await
    .unwrap();
    chat::save_message_to_chat_session(
        &mut conn,
        session.id,
        mailmind::models::chat::ChatRole::Assistant,
        "hi!",
        Some(serde_json::json!([])),
        Some("high"),
        Some("conversation"),
    )
    .await
    .unwrap();

    let after = chat::get_chat_session(&mut conn, session.id).await.unwrap().updated_at;
    assert!(after >= before);

    let turns = chat::get_chat_session_messages(&mut conn, session.id, 100, 0).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].content, "hello");

    let listed = chat::list_chat_sessions(&mut conn, 1000, 0).await.unwrap();
    let ours = listed.iter().find(|s| s.id == session.id).unwrap();
    assert_eq!(ours.message_count, 2);

    // Cascade delete
    chat::delete_chat_session(&mut conn, session.id).await.unwrap();
    assert!(chat::get_chat_session(&mut conn, session.id).await.is_err());
    let orphans = chat::get_chat_session_messages(&mut conn, session.id, 100, 0).await.unwrap();
    assert!(orphans.is_empty());
}

#[tokio::test]
#[ignore]
async fn empty_filters_return_zero_not_errors() {
    let pool = init_test_db().await;
    let mut conn = pool.acquire().await.unwrap();

    let nothing = messages::search_by_sender(&mut conn, "no-such-sender-zzz", 10).await.unwrap();
    assert!(nothing.is_empty());

    let count = messages::count_by_topic(&mut conn, "no-such-topic-zzz").await.unwrap();
    assert_eq!(count, 0);

    let (rows, total) =
        messages::list_messages_by_label(&mut conn, "no-such-label-zzz", 10, 0).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 0);
}
