use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{AdminResource, ComplaintId, ComplaintStatus},
    protocol::{ComplaintStatusUpdate, ComplaintSummary, ConversationSummary, Paginated},
};
use tracing::info;

use crate::{error::RequestError, request_client::RequestClient, NoticeLevel};

/// Listing parameters shared by every resource collection. Unset fields are
/// left off the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

impl ListQuery {
    pub fn page(page: u32, limit: u32) -> Self {
        Self {
            page: Some(page.max(1)),
            limit: Some(limit.clamp(1, 100)),
            ..Self::default()
        }
    }
}

/// Data access for the dashboard's CRUD collections.
#[derive(Clone)]
pub struct AdminApi {
    client: Arc<RequestClient>,
}

impl AdminApi {
    pub fn new(client: Arc<RequestClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<RequestClient> {
        &self.client
    }

    fn item_path(resource: AdminResource, id: i64) -> String {
        format!("{}/{id}", resource.collection_path())
    }

    pub async fn list_as<T: DeserializeOwned>(
        &self,
        resource: AdminResource,
        query: &ListQuery,
    ) -> Result<Paginated<T>, RequestError> {
        self.client
            .get_with_query(resource.collection_path(), query)
            .await
    }

    pub async fn list(
        &self,
        resource: AdminResource,
        query: &ListQuery,
    ) -> Result<Paginated<Value>, RequestError> {
        self.list_as(resource, query).await
    }

    pub async fn get(&self, resource: AdminResource, id: i64) -> Result<Value, RequestError> {
        self.client.get(&Self::item_path(resource, id)).await
    }

    pub async fn create<B: Serialize + ?Sized>(
        &self,
        resource: AdminResource,
        body: &B,
    ) -> Result<Value, RequestError> {
        let created: Value = self.client.post(resource.collection_path(), body).await?;
        info!(resource = resource.name(), "resources: created");
        self.client
            .notify(NoticeLevel::Success, format!("Created in {}", resource.name()));
        Ok(created)
    }

    pub async fn update<B: Serialize + ?Sized>(
        &self,
        resource: AdminResource,
        id: i64,
        body: &B,
    ) -> Result<Value, RequestError> {
        let updated: Value = self
            .client
            .patch(&Self::item_path(resource, id), body)
            .await?;
        info!(resource = resource.name(), id, "resources: updated");
        self.client
            .notify(NoticeLevel::Success, format!("Updated {} #{id}", resource.name()));
        Ok(updated)
    }

    pub async fn delete(&self, resource: AdminResource, id: i64) -> Result<(), RequestError> {
        let _: Value = self.client.delete(&Self::item_path(resource, id)).await?;
        info!(resource = resource.name(), id, "resources: deleted");
        self.client
            .notify(NoticeLevel::Success, format!("Deleted {} #{id}", resource.name()));
        Ok(())
    }

    pub async fn conversations(
        &self,
        query: &ListQuery,
    ) -> Result<Paginated<ConversationSummary>, RequestError> {
        self.list_as(AdminResource::Conversations, query).await
    }

    pub async fn complaints(
        &self,
        query: &ListQuery,
    ) -> Result<Paginated<ComplaintSummary>, RequestError> {
        self.list_as(AdminResource::Complaints, query).await
    }

    pub async fn update_complaint_status(
        &self,
        complaint_id: ComplaintId,
        status: ComplaintStatus,
    ) -> Result<ComplaintSummary, RequestError> {
        let path = format!(
            "{}/status",
            Self::item_path(AdminResource::Complaints, complaint_id.0)
        );
        self.client
            .patch(&path, &ComplaintStatusUpdate { status })
            .await
    }
}

#[cfg(test)]
#[path = "tests/resources_tests.rs"]
mod tests;
