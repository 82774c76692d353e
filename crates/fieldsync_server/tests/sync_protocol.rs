//! End-to-end pull/push behavior through the request path.

use fieldsync_protocol::{ChangeSet, PullRequest, PushRequest, Ticket};
use fieldsync_server::{ServerConfig, ServerError};
use fieldsync_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::HashSet;

/// A ticket as a client would send it after creating it at `created_at`.
fn new_ticket(id: &str, title: &str, created_at: i64) -> Ticket {
    let mut record = ticket("loc-1", id, title);
    record.created_at = created_at;
    record.updated_at = created_at;
    record
}

fn creating(tickets: impl IntoIterator<Item = Ticket>) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.tickets.created.extend(tickets);
    changes
}

fn updating(record: Ticket) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.tickets.updated.push(record);
    changes
}

fn ids(tickets: &[Ticket]) -> Vec<&str> {
    tickets.iter().map(|t| t.id.as_str()).collect()
}

#[tokio::test]
async fn limit_one_pages_through_two_tickets() {
    let server = TestServer::new().await;
    let token = server.token("tech-1", "loc-1");

    server.clock.set(2000);
    server
        .push_changes(
            &token,
            "loc-1",
            None,
            creating([new_ticket("t1", "a", 1500), new_ticket("t2", "b", 1500)]),
        )
        .await;

    server.clock.set(3000);
    let first = server
        .pull(&token, &PullRequest::new("loc-1", None).with_limit(1))
        .await;
    assert!(first.has_more);
    assert_eq!(first.timestamp, 3000);
    let cursor = first.next_cursor.expect("first page has a cursor");
    assert_eq!(cursor.tickets_offset, 1);
    assert_eq!(cursor.snapshot_at, 3000);
    assert_eq!(ids(&first.changes.tickets.created), vec!["t1"]);

    server.clock.set(3500);
    let second = server
        .pull(
            &token,
            &PullRequest::new("loc-1", None)
                .with_limit(1)
                .with_cursor(Some(cursor)),
        )
        .await;
    assert!(!second.has_more);
    assert!(second.next_cursor.is_none());
    assert_eq!(second.timestamp, 3000);
    assert_eq!(ids(&second.changes.tickets.created), vec!["t2"]);
}

#[tokio::test]
async fn records_are_classified_against_the_checkpoint() {
    let server = TestServer::new().await;
    let token = server.token("tech-1", "loc-1");

    server.clock.set(1000);
    server
        .push_changes(&token, "loc-1", None, creating([new_ticket("t1", "new", 1000)]))
        .await;
    let page = server.pull(&token, &PullRequest::new("loc-1", Some(900))).await;
    assert_eq!(ids(&page.changes.tickets.created), vec!["t1"]);
    assert!(page.changes.tickets.updated.is_empty());

    server.clock.set(2000);
    server
        .push_changes(&token, "loc-1", Some(1000), updating(new_ticket("t1", "edited", 1000)))
        .await;
    let page = server.pull(&token, &PullRequest::new("loc-1", Some(1500))).await;
    assert_eq!(ids(&page.changes.tickets.updated), vec!["t1"]);
    assert_eq!(page.changes.tickets.updated[0].title, "edited");
    assert!(page.changes.tickets.created.is_empty());

    server.clock.set(3000);
    let mut delete = ChangeSet::default();
    delete.tickets.deleted.push("t1".into());
    server.push_changes(&token, "loc-1", Some(2000), delete).await;
    let page = server.pull(&token, &PullRequest::new("loc-1", Some(2500))).await;
    assert_eq!(page.changes.tickets.deleted, vec!["t1".to_string()]);
    assert!(page.changes.tickets.created.is_empty());
    assert!(page.changes.tickets.updated.is_empty());

    // A first sync never hears about rows that are already gone.
    let page = server.pull(&token, &PullRequest::new("loc-1", None)).await;
    assert!(page.changes.is_empty());
}

#[tokio::test]
async fn record_created_and_deleted_in_one_window_is_only_a_delete() {
    let server = TestServer::new().await;
    let token = server.token("tech-1", "loc-1");

    server.clock.set(1000);
    server
        .push_changes(&token, "loc-1", None, creating([new_ticket("t1", "short-lived", 1000)]))
        .await;
    server.clock.set(1100);
    let mut delete = ChangeSet::default();
    delete.tickets.deleted.push("t1".into());
    server.push_changes(&token, "loc-1", Some(1000), delete).await;

    let page = server.pull(&token, &PullRequest::new("loc-1", Some(500))).await;
    assert_eq!(page.changes.tickets.deleted, vec!["t1".to_string()]);
    assert!(page.changes.tickets.created.is_empty());
}

#[tokio::test]
async fn stale_update_is_dropped_and_corrected_by_pull() {
    let server = TestServer::new().await;
    let admin = server.token("dispatcher", "loc-1");
    let device_a = server.token("tech-1", "loc-1");

    server.clock.set(1000);
    server
        .push_changes(&admin, "loc-1", None, creating([new_ticket("t1", "authoritative", 800)]))
        .await;

    server.clock.set(1200);
    let mut edit = new_ticket("t1", "from device A", 800);
    edit.updated_at = 950;
    let response = server
        .push_changes(&device_a, "loc-1", Some(900), updating(edit))
        .await;
    assert!(response.ok);
    assert_eq!(response.new_timestamp, 1200);

    let page = server.pull(&device_a, &PullRequest::new("loc-1", Some(900))).await;
    assert_eq!(ids(&page.changes.tickets.updated), vec!["t1"]);
    let t1 = &page.changes.tickets.updated[0];
    assert_eq!(t1.title, "authoritative");
    assert_eq!(t1.updated_at, 1000);
    assert_eq!(t1.sequence_number, Some(1));
}

#[tokio::test]
async fn replayed_push_leaves_the_same_state() {
    let server = TestServer::new().await;
    let token = server.token("tech-1", "loc-1");

    server.clock.set(1000);
    let create = creating([new_ticket("t1", "first", 1000)]);
    server.push_changes(&token, "loc-1", None, create.clone()).await;
    server.clock.set(1100);
    server.push_changes(&token, "loc-1", None, create).await;

    server.clock.set(2000);
    let edit = updating(new_ticket("t1", "second", 1000));
    server.push_changes(&token, "loc-1", Some(1000), edit.clone()).await;
    server.clock.set(2100);
    server.push_changes(&token, "loc-1", Some(1000), edit).await;

    let pages = server.pull_pages(&token, "loc-1", None, 100).await;
    let tickets = &pages[0].changes.tickets.created;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].title, "second");
    assert_eq!(tickets[0].updated_at, 2000);
    assert_eq!(tickets[0].sequence_number, Some(1));
}

#[tokio::test]
async fn snapshot_hides_writes_made_between_pages() {
    let server = TestServer::new().await;
    let token = server.token("tech-1", "loc-1");
    let other = server.token("tech-2", "loc-2");

    server.clock.set(1000);
    server
        .push_changes(
            &token,
            "loc-1",
            None,
            creating([
                new_ticket("t1", "a", 1000),
                new_ticket("t2", "b", 1000),
                new_ticket("t3", "c", 1000),
            ]),
        )
        .await;

    server.clock.set(2000);
    let first = server
        .pull(&token, &PullRequest::new("loc-1", None).with_limit(2))
        .await;
    assert_eq!(ids(&first.changes.tickets.created), vec!["t1", "t2"]);

    server.clock.set(2500);
    server
        .push_changes(&token, "loc-1", Some(2000), creating([new_ticket("t0", "late", 2500)]))
        .await;
    let mut foreign = new_ticket("x1", "other tenant", 2500);
    foreign.location_id = "loc-2".into();
    server
        .push_changes(&other, "loc-2", None, creating([foreign]))
        .await;

    let second = server
        .pull(
            &token,
            &PullRequest::new("loc-1", None)
                .with_limit(2)
                .with_cursor(first.next_cursor),
        )
        .await;
    assert_eq!(ids(&second.changes.tickets.created), vec!["t3"]);
    assert!(!second.has_more);

    let next = server
        .pull(&token, &PullRequest::new("loc-1", Some(second.timestamp)))
        .await;
    assert_eq!(ids(&next.changes.tickets.created), vec!["t0"]);
}

#[tokio::test]
async fn kinds_paginate_independently() {
    let server = TestServer::new().await;
    let token = server.token("tech-1", "loc-1");

    server.clock.set(1000);
    let mut changes = creating([new_ticket("t1", "a", 1000)]);
    for n in 0..3 {
        let mut c = comment("loc-1", &format!("c{n}"), "t1", "note");
        c.created_at = 1000;
        changes.ticket_comments.created.push(c);
    }
    let mut p = payment("loc-1", "p1", "t1", 12_000);
    p.created_at = 1000;
    changes.payment_records.created.push(p);
    server.push_changes(&token, "loc-1", None, changes).await;

    server.clock.set(2000);
    let pages = server.pull_pages(&token, "loc-1", None, 2).await;
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].changes.tickets.created.len(), 1);
    assert_eq!(pages[0].changes.ticket_comments.created.len(), 2);
    assert_eq!(pages[0].changes.payment_records.created.len(), 1);
    assert_eq!(pages[1].changes.ticket_comments.created.len(), 1);
    assert!(pages[1].changes.tickets.created.is_empty());
    assert!(pages.iter().all(|p| p.timestamp == 2000));
}

#[tokio::test]
async fn tenant_guard_runs_before_any_data_access() {
    let server = TestServer::new().await;
    let token = server.token("tech-1", "loc-1");

    let err = server
        .try_pull(&token, &PullRequest::new("loc-2", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::TenantMismatch { .. }));
    assert_eq!(err.status_code(), 403);

    let push = PushRequest::new("loc-2", None, creating([new_ticket("t1", "x", 1)]), "d");
    let err = server.try_push(&token, &push).await.unwrap_err();
    assert!(matches!(err, ServerError::TenantMismatch { .. }));

    server.members.revoke("tech-1", "loc-1");
    let err = server
        .try_pull(&token, &PullRequest::new("loc-1", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NotAuthorized(_)));

    let err = server
        .try_pull("forged.token", &PullRequest::new("loc-1", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn pushed_tickets_get_per_tenant_sequence_numbers() {
    let server = TestServer::new().await;
    let loc1 = server.token("tech-1", "loc-1");
    let loc2 = server.token("tech-2", "loc-2");

    server.clock.set(1000);
    let mut spoofed = new_ticket("t1", "a", 1000);
    spoofed.sequence_number = Some(99);
    server
        .push_changes(
            &loc1,
            "loc-1",
            None,
            creating([spoofed, new_ticket("t2", "b", 1000), new_ticket("t3", "c", 1000)]),
        )
        .await;
    let mut other = new_ticket("u1", "d", 1000);
    other.location_id = "loc-2".into();
    server.push_changes(&loc2, "loc-2", None, creating([other])).await;

    let page = server.pull(&loc1, &PullRequest::new("loc-1", None)).await;
    let numbers: Vec<Option<i64>> = page
        .changes
        .tickets
        .created
        .iter()
        .map(|t| t.sequence_number)
        .collect();
    assert_eq!(numbers, vec![Some(1), Some(2), Some(3)]);

    let page = server.pull(&loc2, &PullRequest::new("loc-2", None)).await;
    assert_eq!(page.changes.tickets.created[0].sequence_number, Some(1));
}

#[tokio::test]
async fn server_caps_requested_page_size() {
    let server = TestServer::with_config(ServerConfig::default().with_max_pull_limit(2)).await;
    let token = server.token("tech-1", "loc-1");

    server.clock.set(1000);
    server
        .push_changes(
            &token,
            "loc-1",
            None,
            creating((0..5).map(|n| new_ticket(&format!("t{n}"), "x", 1000))),
        )
        .await;

    let page = server
        .pull(&token, &PullRequest::new("loc-1", None).with_limit(500))
        .await;
    assert_eq!(page.changes.tickets.created.len(), 2);
    assert!(page.has_more);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pagination_returns_every_record_once(
        tickets in distinct_tickets_strategy("loc-1", 25),
        groups in prop::collection::vec(0i64..4, 25),
        limit in 1u32..7,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let server = TestServer::new().await;
            let token = server.token("tech-1", "loc-1");

            let expected: HashSet<String> = tickets.iter().map(|t| t.id.clone()).collect();
            for (n, record) in tickets.into_iter().enumerate() {
                // Several records share an updatedAt so ties are ordered by id.
                server.clock.set(1000 + groups[n] * 10);
                server
                    .push_changes(&token, "loc-1", None, creating([record]))
                    .await;
            }

            server.clock.set(5000);
            let pages = server.pull_pages(&token, "loc-1", None, limit).await;
            let mut seen = HashSet::new();
            for page in &pages {
                assert_eq!(page.timestamp, 5000);
                assert!(page.changes.tickets.created.len() <= limit as usize);
                for record in &page.changes.tickets.created {
                    assert!(seen.insert(record.id.clone()), "duplicate {}", record.id);
                }
            }
            assert_eq!(seen, expected);
        });
    }
}
