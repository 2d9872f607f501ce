use async_trait::async_trait;
use chrono::{Datelike, Utc};
use libsql::params;
use serde::Serialize;
use uuid::Uuid;

use super::{
    CategoryRef, CommentVisibility, FALLBACK_CATEGORY, NewTicket, PROVISIONED_CATEGORY,
    PROVISIONED_CATEGORY_DESCRIPTION, TicketError, TicketRef, TicketResult, TicketService, TicketStatus,
};
use crate::database::models::{EntityKey, from_unix};
use crate::pool::{LibsqlManager, LibsqlPool};

/// Ticket desk stored in the monitoring database itself
pub struct LocalTicketService {
    pool: LibsqlPool,
}

/// Stored ticket as read back from the local desk
#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    pub id: String,
    pub number: String,
    pub title: String,
    pub description: String,
    pub category_id: String,
    pub priority: String,
    pub status: TicketStatus,
    pub classification: String,
    pub linked_entity: Option<EntityKey>,
    pub resolution_note: Option<String>,
    pub resolved_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketComment {
    pub body: String,
    pub visibility: CommentVisibility,
}

impl LocalTicketService {
    pub fn new(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> TicketResult<deadpool::managed::Object<LibsqlManager>> {
        self.pool.get().await.map_err(|e| TicketError::Store(e.to_string()))
    }

    /// First active category whose name contains `fragment`, case-insensitive
    async fn find_category(&self, fragment: &str) -> TicketResult<Option<CategoryRef>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name FROM service_categories
                 WHERE is_active = 1 AND instr(lower(name), lower(?)) > 0
                 ORDER BY length(name), name LIMIT 1",
                params![fragment],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(CategoryRef { id: row.get(0)?, name: row.get(1)? })),
            None => Ok(None),
        }
    }

    async fn provision_category(&self) -> TicketResult<CategoryRef> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO service_categories (id, name, description, is_active, created_at)
             VALUES (?, ?, ?, 1, ?)",
            params![
                Uuid::new_v4().to_string(),
                PROVISIONED_CATEGORY,
                PROVISIONED_CATEGORY_DESCRIPTION,
                Utc::now().timestamp()
            ],
        )
        .await?;

        let mut rows = conn
            .query("SELECT id, name FROM service_categories WHERE name = ?", params![PROVISIONED_CATEGORY])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(CategoryRef { id: row.get(0)?, name: row.get(1)? }),
            None => Err(TicketError::Store(format!("category {PROVISIONED_CATEGORY} vanished after insert"))),
        }
    }

    /// Add a category by name, used to seed the desk
    pub async fn add_category(&self, name: &str, description: Option<&str>) -> TicketResult<CategoryRef> {
        let conn = self.get_conn().await?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO service_categories (id, name, description, is_active, created_at) VALUES (?, ?, ?, 1, ?)",
            params![id.clone(), name, description, Utc::now().timestamp()],
        )
        .await?;
        Ok(CategoryRef { id, name: name.to_string() })
    }

    pub async fn get_ticket(&self, ticket_id: &str) -> TicketResult<Option<Ticket>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, ticket_number, title, description, category_id, priority, status, classification,
                        entity_class, entity_id, resolution_note, resolved_at
                 FROM tickets WHERE id = ?",
                params![ticket_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let status: String = row.get(6)?;
        let entity_class: Option<String> = row.get(8)?;
        let entity_id: Option<String> = row.get(9)?;
        let linked_entity = match (entity_class, entity_id) {
            (Some(class), Some(id)) => Some(EntityKey::new(class.parse().map_err(TicketError::Store)?, id)),
            _ => None,
        };

        Ok(Some(Ticket {
            id: row.get(0)?,
            number: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            category_id: row.get(4)?,
            priority: row.get(5)?,
            status: status.parse().map_err(TicketError::Store)?,
            classification: row.get(7)?,
            linked_entity,
            resolution_note: row.get(10)?,
            resolved_at: row.get::<Option<i64>>(11)?.map(from_unix),
        }))
    }

    /// Oldest first
    pub async fn comments(&self, ticket_id: &str) -> TicketResult<Vec<TicketComment>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT body, visibility FROM ticket_comments WHERE ticket_id = ? ORDER BY id ASC",
                params![ticket_id],
            )
            .await?;

        let mut comments = Vec::new();
        while let Some(row) = rows.next().await? {
            let visibility: String = row.get(1)?;
            comments.push(TicketComment {
                body: row.get(0)?,
                visibility: visibility.parse().map_err(TicketError::Store)?,
            });
        }
        Ok(comments)
    }
}

#[async_trait]
impl TicketService for LocalTicketService {
    async fn find_or_create_service_category(&self, name_hint: &str) -> TicketResult<CategoryRef> {
        if let Some(category) = self.find_category(name_hint).await? {
            return Ok(category);
        }

        if let Some(category) = self.find_category(FALLBACK_CATEGORY).await? {
            tracing::debug!(requested = name_hint, using = %category.name, "Using fallback service category");
            return Ok(category);
        }

        let category = self.provision_category().await?;
        tracing::info!(category = %category.name, "Provisioned service category");
        Ok(category)
    }

    async fn create_ticket(&self, ticket: NewTicket) -> TicketResult<TicketRef> {
        let conn = self.get_conn().await?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let year = now.year();
        let prefix = format!("NET-{year}-%");

        // numbering and insert in one statement so concurrent creates cannot share a number
        conn.execute(
            "INSERT INTO tickets (id, ticket_number, title, description, category_id, priority, status,
                                  classification, entity_class, entity_id, created_at, updated_at)
             SELECT ?, printf('NET-%d-%04d', ?, COUNT(*) + 1), ?, ?, ?, ?, 'OPEN', ?, ?, ?, ?, ?
             FROM tickets WHERE ticket_number LIKE ?",
            params![
                id.clone(),
                year,
                ticket.title,
                ticket.description,
                ticket.category.id,
                ticket.priority.as_str(),
                ticket.classification.as_str(),
                ticket.linked_entity.as_ref().map(|k| k.class.as_str().to_string()),
                ticket.linked_entity.as_ref().map(|k| k.id.clone()),
                now.timestamp(),
                now.timestamp(),
                prefix,
            ],
        )
        .await?;

        let mut rows = conn.query("SELECT ticket_number FROM tickets WHERE id = ?", params![id.clone()]).await?;
        let number: String = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => return Err(TicketError::Store(format!("ticket {id} missing after insert"))),
        };

        tracing::info!(ticket = %number, "Created ticket");
        Ok(TicketRef { id, number })
    }

    async fn update_ticket_status(&self, ticket_id: &str, status: TicketStatus, note: Option<&str>) -> TicketResult<()> {
        let conn = self.get_conn().await?;
        let now = Utc::now().timestamp();
        let closed = matches!(status, TicketStatus::Resolved | TicketStatus::Closed);

        let updated = conn
            .execute(
                "UPDATE tickets
                 SET status = ?, updated_at = ?, resolved_at = ?, resolution_note = COALESCE(?, resolution_note)
                 WHERE id = ?",
                params![status.as_str(), now, closed.then_some(now), note, ticket_id],
            )
            .await?;

        if updated == 0 {
            return Err(TicketError::NotFound(ticket_id.to_string()));
        }
        Ok(())
    }

    async fn append_ticket_comment(&self, ticket_id: &str, text: &str, visibility: CommentVisibility) -> TicketResult<()> {
        let conn = self.get_conn().await?;
        let inserted = conn
            .execute(
                "INSERT INTO ticket_comments (ticket_id, body, visibility, created_at)
                 SELECT id, ?, ?, ? FROM tickets WHERE id = ?",
                params![text, visibility.as_str(), Utc::now().timestamp(), ticket_id],
            )
            .await?;

        if inserted == 0 {
            return Err(TicketError::NotFound(ticket_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::EntityClass;
    use crate::database::test_support::create_test_database;
    use crate::ticketing::{IssueClassification, TicketPriority};

    fn new_ticket(category: CategoryRef) -> NewTicket {
        NewTicket {
            title: "COMMUNICATION OFFLINE - Lobby ATM".into(),
            description: "Automated network monitoring alert".into(),
            category,
            priority: TicketPriority::High,
            linked_entity: Some(EntityKey::new(EntityClass::Atm, "01")),
            classification: IssueClassification::NetworkIssue,
        }
    }

    #[tokio::test]
    async fn test_category_fallback_chain() {
        let (_dir, db) = create_test_database().await.unwrap();
        let desk = LocalTicketService::new(db.pool().clone());

        // nothing seeded: provisions the default category, then keeps finding it
        let provisioned = desk.find_or_create_service_category("Network").await.unwrap();
        assert_eq!(provisioned.name, PROVISIONED_CATEGORY);
        let again = desk.find_or_create_service_category("Network").await.unwrap();
        assert_eq!(again, provisioned);

        // unknown hint falls back to an Infrastructure category
        let fallback = desk.find_or_create_service_category("Telephony").await.unwrap();
        assert_eq!(fallback, provisioned);

        let exact = desk.add_category("Telephony", None).await.unwrap();
        assert_eq!(desk.find_or_create_service_category("telephony").await.unwrap(), exact);
    }

    #[tokio::test]
    async fn test_ticket_numbers_are_sequential_per_year() {
        let (_dir, db) = create_test_database().await.unwrap();
        let desk = LocalTicketService::new(db.pool().clone());
        let category = desk.find_or_create_service_category("Network").await.unwrap();

        let first = desk.create_ticket(new_ticket(category.clone())).await.unwrap();
        let second = desk.create_ticket(new_ticket(category)).await.unwrap();

        let year = Utc::now().year();
        assert_eq!(first.number, format!("NET-{year}-0001"));
        assert_eq!(second.number, format!("NET-{year}-0002"));

        let stored = desk.get_ticket(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Open);
        assert_eq!(stored.priority, "HIGH");
        assert_eq!(stored.linked_entity, Some(EntityKey::new(EntityClass::Atm, "01")));
    }

    #[tokio::test]
    async fn test_resolve_and_reopen() {
        let (_dir, db) = create_test_database().await.unwrap();
        let desk = LocalTicketService::new(db.pool().clone());
        let category = desk.find_or_create_service_category("Network").await.unwrap();
        let ticket = desk.create_ticket(new_ticket(category)).await.unwrap();

        desk.update_ticket_status(&ticket.id, TicketStatus::Resolved, Some("recovered")).await.unwrap();
        desk.append_ticket_comment(&ticket.id, "back online", CommentVisibility::Public).await.unwrap();

        let resolved = desk.get_ticket(&ticket.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, TicketStatus::Resolved);
        assert_eq!(resolved.resolution_note.as_deref(), Some("recovered"));
        assert!(resolved.resolved_at.is_some());

        desk.update_ticket_status(&ticket.id, TicketStatus::Open, None).await.unwrap();
        let reopened = desk.get_ticket(&ticket.id).await.unwrap().unwrap();
        assert_eq!(reopened.status, TicketStatus::Open);
        assert!(reopened.resolved_at.is_none());

        let comments = desk.comments(&ticket.id).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].visibility, CommentVisibility::Public);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_not_found() {
        let (_dir, db) = create_test_database().await.unwrap();
        let desk = LocalTicketService::new(db.pool().clone());

        let status = desk.update_ticket_status("missing", TicketStatus::Resolved, None).await;
        assert!(matches!(status, Err(TicketError::NotFound(_))));

        let comment = desk.append_ticket_comment("missing", "hi", CommentVisibility::Internal).await;
        assert!(matches!(comment, Err(TicketError::NotFound(_))));
    }
}
