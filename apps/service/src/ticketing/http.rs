use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

use super::{
    CategoryRef, CommentVisibility, FALLBACK_CATEGORY, NewTicket, PROVISIONED_CATEGORY,
    PROVISIONED_CATEGORY_DESCRIPTION, TicketError, TicketRef, TicketResult, TicketService, TicketStatus,
};

/// Client for an external helpdesk speaking JSON over HTTP
pub struct HttpTicketService {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedTicket {
    id: String,
    #[serde(default, alias = "ticketNumber", alias = "number")]
    ticket_number: Option<String>,
}

impl HttpTicketService {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> TicketResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(TicketError::InvalidUrl(format!("unsupported scheme: {}", base_url.scheme())));
        }
        // keep any path prefix when joining endpoints
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url, api_token })
    }

    fn endpoint(&self, path: &str) -> TicketResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response, what: &str) -> TicketResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(TicketError::NotFound(what.to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        Err(TicketError::Api { status: status.as_u16(), message })
    }

    async fn search_category(&self, name: &str) -> TicketResult<Option<CategoryRef>> {
        let mut url = self.endpoint("categories")?;
        url.query_pairs_mut().append_pair("name", name);

        let response = self.authorized(self.client.get(url)).send().await?;
        let categories: Vec<CategoryRef> = Self::check(response, "categories").await?.json().await?;
        Ok(categories.into_iter().next())
    }
}

#[async_trait]
impl TicketService for HttpTicketService {
    async fn find_or_create_service_category(&self, name_hint: &str) -> TicketResult<CategoryRef> {
        for name in [name_hint, FALLBACK_CATEGORY] {
            if let Some(category) = self.search_category(name).await? {
                return Ok(category);
            }
        }

        let body = json!({ "name": PROVISIONED_CATEGORY, "description": PROVISIONED_CATEGORY_DESCRIPTION });
        let response = self.authorized(self.client.post(self.endpoint("categories")?)).json(&body).send().await?;
        let category: CategoryRef = Self::check(response, "categories").await?.json().await?;
        tracing::info!(category = %category.name, "Provisioned service category on helpdesk");
        Ok(category)
    }

    async fn create_ticket(&self, ticket: NewTicket) -> TicketResult<TicketRef> {
        let body = json!({
            "title": ticket.title,
            "description": ticket.description,
            "category_id": ticket.category.id,
            "priority": ticket.priority,
            "classification": ticket.classification,
            "entity": ticket.linked_entity.as_ref().map(|key| key.to_string()),
        });

        let response = self.authorized(self.client.post(self.endpoint("tickets")?)).json(&body).send().await?;
        let created: CreatedTicket = Self::check(response, "tickets").await?.json().await?;

        let number = created.ticket_number.unwrap_or_else(|| created.id.clone());
        Ok(TicketRef { id: created.id, number })
    }

    async fn update_ticket_status(&self, ticket_id: &str, status: TicketStatus, note: Option<&str>) -> TicketResult<()> {
        let url = self.endpoint(&format!("tickets/{ticket_id}"))?;
        let body = json!({ "status": status, "resolution_note": note });

        let response = self.authorized(self.client.patch(url)).json(&body).send().await?;
        Self::check(response, ticket_id).await?;
        Ok(())
    }

    async fn append_ticket_comment(&self, ticket_id: &str, text: &str, visibility: CommentVisibility) -> TicketResult<()> {
        let url = self.endpoint(&format!("tickets/{ticket_id}/comments"))?;
        let body = json!({ "text": text, "visibility": visibility });

        let response = self.authorized(self.client.post(url)).json(&body).send().await?;
        Self::check(response, ticket_id).await?;
        Ok(())
    }
}
