//! Role-based topic routing.
//!
//! A role names the topics an endpoint listens to and the topics it may send
//! to. Topic names get the environment suffix from `RelayConfig::topic_name`;
//! each listen topic is consumed through `<topic>_subscription`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::PublishFuture;
use crate::context::TransportContext;
use crate::error::{PublishError, RouteError};
use crate::payload::Payload;
use crate::pipeline::MessageHandler;
use crate::publisher::Publisher;
use crate::supervisor::{StreamHandle, StreamStats, StreamSupervisor};

const SUBSCRIPTION_SUFFIX: &str = "_subscription";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicRoutes {
    pub listen_to: Vec<String>,
    pub send_to: Vec<String>,
}

/// Role name -> routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    roles: BTreeMap<String, TopicRoutes>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role<L, S>(mut self, name: impl Into<String>, listen_to: L, send_to: S) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        self.roles.insert(
            name.into(),
            TopicRoutes {
                listen_to: listen_to.into_iter().map(Into::into).collect(),
                send_to: send_to.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn get(&self, role: &str) -> Result<&TopicRoutes, RouteError> {
        self.roles
            .get(role)
            .ok_or_else(|| RouteError::UnknownRole(role.to_string()))
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}

/// A named participant bound to a role: it listens on the role's topics and
/// may only publish to the role's send topics.
pub struct Endpoint {
    name: String,
    role: String,
    context: Arc<TransportContext>,
    publisher: Publisher,
    supervisor: StreamSupervisor,
    streams: Vec<StreamHandle>,
    sending_to: Vec<String>,
}

impl Endpoint {
    pub fn bind<H>(
        name: impl Into<String>,
        context: Arc<TransportContext>,
        routes: &RouteTable,
        role: &str,
        handler: H,
    ) -> Result<Self, RouteError>
    where
        H: MessageHandler + 'static,
    {
        let name = name.into();
        let topics = routes.get(role)?;
        let supervisor = StreamSupervisor::new(Arc::clone(&context));
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);

        let mut streams = Vec::with_capacity(topics.listen_to.len());
        for base in &topics.listen_to {
            let topic = context.config().topic_name(base);
            let subscription = format!("{topic}{SUBSCRIPTION_SUFFIX}");
            match supervisor.start_shared(&topic, &subscription, Arc::clone(&handler)) {
                Ok(handle) => {
                    info!(endpoint = %name, topic = %topic, "endpoint listening");
                    streams.push(handle);
                }
                Err(err) => {
                    for handle in &streams {
                        supervisor.stop(handle.key());
                    }
                    return Err(err.into());
                }
            }
        }

        let sending_to = topics
            .send_to
            .iter()
            .map(|base| context.config().topic_name(base))
            .collect();

        Ok(Self {
            name,
            role: role.to_string(),
            publisher: Publisher::new(Arc::clone(&context)),
            context,
            supervisor,
            streams,
            sending_to,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Resolved names of the topics this endpoint listens to.
    pub fn listen_to(&self) -> Vec<&str> {
        self.streams
            .iter()
            .map(|handle| handle.key().topic.as_str())
            .collect()
    }

    /// Resolved names of the topics this endpoint may publish to.
    pub fn sending_to(&self) -> &[String] {
        &self.sending_to
    }

    pub fn streams(&self) -> &[StreamHandle] {
        &self.streams
    }

    /// Publish to a send topic, given by base or resolved name.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
    ) -> Result<PublishFuture, PublishError> {
        let resolved = if self.sending_to.iter().any(|t| t == topic) {
            topic.to_string()
        } else {
            self.context.config().topic_name(topic)
        };
        if !self.sending_to.contains(&resolved) {
            warn!(endpoint = %self.name, topic, "publish outside send routes refused");
            return Err(PublishError::NotPermitted(topic.to_string()));
        }
        self.publisher.publish(&resolved, payload)
    }

    /// Stop every stream this endpoint started.
    pub fn shutdown(&self) -> Vec<StreamStats> {
        self.streams
            .iter()
            .filter_map(|handle| self.supervisor.stop(handle.key()))
            .collect()
    }
}
