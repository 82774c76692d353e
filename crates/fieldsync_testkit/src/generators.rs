//! Record builders and property-based test generators.

use fieldsync_protocol::{PaymentRecord, Ticket, TicketAttachment, TicketComment, TicketStatus};
use proptest::prelude::*;

/// An open ticket in `location_id`.
pub fn ticket(location_id: &str, id: &str, title: &str) -> Ticket {
    Ticket {
        id: id.into(),
        location_id: location_id.into(),
        sequence_number: None,
        title: title.into(),
        description: None,
        status: TicketStatus::Open,
        customer_name: None,
        assigned_to: None,
        scheduled_for: None,
        created_at: 0,
        updated_at: 0,
        deleted_at: None,
    }
}

/// A comment on `ticket_id`.
pub fn comment(location_id: &str, id: &str, ticket_id: &str, body: &str) -> TicketComment {
    TicketComment {
        id: id.into(),
        location_id: location_id.into(),
        ticket_id: ticket_id.into(),
        author_id: "tech-1".into(),
        body: body.into(),
        created_at: 0,
        updated_at: 0,
        deleted_at: None,
    }
}

/// Attachment metadata on `ticket_id`.
pub fn attachment(
    location_id: &str,
    id: &str,
    ticket_id: &str,
    file_name: &str,
) -> TicketAttachment {
    TicketAttachment {
        id: id.into(),
        location_id: location_id.into(),
        ticket_id: ticket_id.into(),
        file_name: file_name.into(),
        content_type: "image/jpeg".into(),
        size_bytes: 204_800,
        storage_key: None,
        created_at: 0,
        updated_at: 0,
        deleted_at: None,
    }
}

/// A card payment against `ticket_id`.
pub fn payment(location_id: &str, id: &str, ticket_id: &str, amount_cents: i64) -> PaymentRecord {
    PaymentRecord {
        id: id.into(),
        location_id: location_id.into(),
        ticket_id: ticket_id.into(),
        amount_cents,
        currency: "EUR".into(),
        method: "card".into(),
        recorded_by: Some("tech-1".into()),
        note: None,
        created_at: 0,
        updated_at: 0,
    }
}

/// Strategy for ticket states.
pub fn ticket_status_strategy() -> impl Strategy<Value = TicketStatus> {
    prop_oneof![
        Just(TicketStatus::Open),
        Just(TicketStatus::Scheduled),
        Just(TicketStatus::InProgress),
        Just(TicketStatus::Completed),
        Just(TicketStatus::Cancelled),
    ]
}

/// Strategy for tickets in `location_id` with ids `t0`, `t1`, ... up to
/// `max_id`.
pub fn ticket_strategy(location_id: &'static str, max_id: u32) -> impl Strategy<Value = Ticket> {
    (
        0..max_id.max(1),
        prop::string::string_regex("[A-Za-z][A-Za-z0-9 ]{0,40}").expect("Invalid regex"),
        ticket_status_strategy(),
        prop::option::of(prop::string::string_regex("[A-Z][a-z]{1,12}").expect("Invalid regex")),
    )
        .prop_map(move |(n, title, status, customer)| {
            let mut record = ticket(location_id, &format!("t{n}"), &title);
            record.status = status;
            record.customer_name = customer;
            record
        })
}

/// Strategy for a batch of tickets with distinct ids.
pub fn distinct_tickets_strategy(
    location_id: &'static str,
    max_len: usize,
) -> impl Strategy<Value = Vec<Ticket>> {
    prop::collection::vec(ticket_strategy(location_id, 10_000), 0..=max_len).prop_map(|tickets| {
        let mut seen = std::collections::HashSet::new();
        tickets
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .collect()
    })
}
