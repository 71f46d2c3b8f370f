//! The sync orchestrator.
//!
//! A single actor task owns the live [`Document`]. Local edits arrive as
//! [`Command`]s from [`SyncHandle`]s, remote snapshots arrive as
//! [`TransportEvent`]s from the session's transport, and both are applied
//! one at a time on that task. Observers read status, auth state and the
//! current document through `tokio::sync::watch` channels.
//!
//! # Save path
//!
//! ```text
//! local edit ──► debounce ──► persist ──► broadcast
//! remote snapshot ──► merge ──► persist            (never broadcast)
//! ```
//!
//! Broadcasts run on a per-session broadcaster task so a slow network never
//! stalls an edit. Queued broadcasts are coalesced: only the newest
//! snapshot is sent.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tasksync_proto::codec::{self, SchemaVersion};
use tasksync_proto::model::{Document, Geometry, ItemId, ListId, Millis};
use tasksync_proto::remote::RemoteVersion;
use tasksync_proto::tombstone::TOMBSTONE_RETENTION;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::merge::merge_documents;
use super::mutation::{self, ItemMutation, Mutation};
use super::{AuthState, SyncError, SyncStatus};
use crate::auth::Identity;
use crate::clock::Clock;
use crate::store::{self, DocumentStore, StoreError};
use crate::transport::{
    LinkStatus, Transport, TransportError, TransportEvent, TransportFactory,
};

/// Timing and sizing of the orchestrator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before a local edit is saved and broadcast.
    pub debounce: Duration,
    /// Wait after sign-in before uploading local data if the remote stayed
    /// silent.
    pub bootstrap_delay: Duration,
    /// Delay before retrying a failed broadcast.
    pub republish_delay: Duration,
    /// Age after which tombstones are pruned.
    pub tombstone_retention: Duration,
    /// Capacity of the command and transport event channels.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            bootstrap_delay: Duration::from_millis(2500),
            republish_delay: Duration::from_secs(10),
            tombstone_retention: TOMBSTONE_RETENTION,
            channel_capacity: 64,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

#[derive(Debug)]
enum Command {
    SignIn {
        identity: Identity,
        reply: Reply<()>,
    },
    SignOut {
        reply: Reply<()>,
    },
    CreateList {
        title: String,
        reply: Reply<ListId>,
    },
    DeleteList {
        list_id: ListId,
        reply: Reply<()>,
    },
    CreateItem {
        list_id: ListId,
        content: String,
        reply: Reply<ItemId>,
    },
    DeleteItem {
        item_id: ItemId,
        reply: Reply<()>,
    },
    Mutate {
        list_id: ListId,
        item_id: Option<ItemId>,
        mutation: Mutation,
        reply: Reply<()>,
    },
    UpdateItem {
        item_id: ItemId,
        mutation: ItemMutation,
        reply: Reply<()>,
    },
    SetMergedOrder {
        order: Vec<ItemId>,
        reply: Reply<()>,
    },
    SetMergedGeometry {
        geometry: Geometry,
        reply: Reply<()>,
    },
    ManualRefresh {
        reply: Reply<()>,
    },
    ForegroundRefresh {
        reply: Reply<()>,
    },
    Flush {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// A snapshot waiting for the broadcaster.
struct Outgoing {
    payload: Vec<u8>,
    reply: Option<Reply<()>>,
}

/// Results reported back to the actor by its helper tasks.
enum Internal {
    Broadcast {
        generation: u64,
        result: Result<RemoteVersion, TransportError>,
    },
}

/// Everything tied to one signed-in identity.
struct Session<T> {
    identity: Identity,
    generation: u64,
    transport: Arc<T>,
    events: mpsc::Receiver<TransportEvent>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    received_remote: bool,
}

/// The orchestrator actor. Created and driven by [`SyncEngine::spawn`].
pub struct SyncEngine<F: TransportFactory, S, C> {
    factory: F,
    store: S,
    clock: C,
    config: SyncConfig,
    doc: Document,
    session: Option<Session<F::Transport>>,
    generation: u64,
    link: Option<LinkStatus>,
    persist_error: Option<String>,
    save_deadline: Option<Instant>,
    save_broadcasts: bool,
    bootstrap_deadline: Option<Instant>,
    republish_deadline: Option<Instant>,
    status_tx: watch::Sender<SyncStatus>,
    auth_tx: watch::Sender<AuthState>,
    doc_tx: watch::Sender<Arc<Document>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl<F, S, C> SyncEngine<F, S, C>
where
    F: TransportFactory,
    S: DocumentStore,
    C: Clock,
{
    /// Loads the local snapshot and starts the orchestrator task.
    ///
    /// A snapshot in the legacy schema is upgraded in memory; one that
    /// matches no schema is discarded with a warning and the engine starts
    /// empty. The engine starts signed out.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Persist`] if the snapshot cannot be read at all,
    /// so that a transient read failure never leads to it being overwritten.
    pub async fn spawn(
        factory: F,
        store: S,
        clock: C,
        config: SyncConfig,
    ) -> Result<SyncHandle, SyncError> {
        let doc = match store::load_document(&store).await {
            Ok(Some((doc, SchemaVersion::Current))) => doc,
            Ok(Some((doc, SchemaVersion::Legacy))) => {
                tracing::info!(lists = doc.lists.len(), "upgraded legacy local snapshot");
                doc
            }
            Ok(None) => Document::default(),
            Err(StoreError::Codec(e)) => {
                tracing::warn!(error = %e, "local snapshot is unreadable, starting empty");
                Document::default()
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(lists = doc.lists.len(), "loaded local document");

        let (commands_tx, commands_rx) = mpsc::channel(config.channel_capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected);
        let (auth_tx, auth_rx) = watch::channel(AuthState::SignedOut);
        let (doc_tx, doc_rx) = watch::channel(Arc::new(doc.clone()));

        let engine = Self {
            factory,
            store,
            clock,
            config,
            doc,
            session: None,
            generation: 0,
            link: None,
            persist_error: None,
            save_deadline: None,
            save_broadcasts: false,
            bootstrap_deadline: None,
            republish_deadline: None,
            status_tx,
            auth_tx,
            doc_tx,
            internal_tx,
        };
        tokio::spawn(engine.run(commands_rx, internal_rx));

        Ok(SyncHandle {
            commands: commands_tx,
            status: status_rx,
            auth: auth_rx,
            document: doc_rx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        break;
                    };
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                event = next_event(&mut self.session) => self.on_event(event).await,
                Some(message) = internal.recv() => self.on_internal(message),
                () = sleep_until_opt(self.save_deadline) => self.run_save().await,
                () = sleep_until_opt(self.bootstrap_deadline) => self.run_bootstrap(),
                () = sleep_until_opt(self.republish_deadline) => {
                    self.republish_deadline = None;
                    self.enqueue_broadcast(None);
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SignIn { identity, reply } => {
                let _ = reply.send(self.sign_in(identity).await);
            }
            Command::SignOut { reply } => {
                self.sign_out().await;
                let _ = reply.send(Ok(()));
            }
            Command::CreateList { title, reply } => {
                let result = self.edit(|doc, now| Ok(mutation::create_list(doc, title, now)));
                let _ = reply.send(result);
            }
            Command::DeleteList { list_id, reply } => {
                let result = self.edit(|doc, now| mutation::delete_list(doc, list_id, now).map(drop));
                let _ = reply.send(result);
            }
            Command::CreateItem {
                list_id,
                content,
                reply,
            } => {
                let result = self.edit(|doc, now| mutation::create_item(doc, list_id, content, now));
                let _ = reply.send(result);
            }
            Command::DeleteItem { item_id, reply } => {
                let result = self.edit(|doc, now| mutation::delete_item(doc, item_id, now).map(drop));
                let _ = reply.send(result);
            }
            Command::Mutate {
                list_id,
                item_id,
                mutation: change,
                reply,
            } => {
                let result =
                    self.edit(|doc, now| mutation::apply(doc, list_id, item_id, &change, now));
                let _ = reply.send(result);
            }
            Command::UpdateItem {
                item_id,
                mutation: change,
                reply,
            } => {
                let result =
                    self.edit(|doc, now| mutation::update_item(doc, item_id, change, now).map(drop));
                let _ = reply.send(result);
            }
            Command::SetMergedOrder { order, reply } => {
                let result = self.edit(|doc, _now| {
                    let live: HashSet<ItemId> = doc.item_ids().collect();
                    doc.merged_task_order = order.into_iter().filter(|id| live.contains(id)).collect();
                    Ok(())
                });
                let _ = reply.send(result);
            }
            Command::SetMergedGeometry { geometry, reply } => {
                let result = self.edit(|doc, _now| {
                    doc.merged_geometry = geometry;
                    Ok(())
                });
                let _ = reply.send(result);
            }
            Command::ManualRefresh { reply } => {
                self.manual_refresh().await;
                let _ = reply.send(Ok(()));
            }
            Command::ForegroundRefresh { reply } => {
                let _ = reply.send(self.foreground_refresh().await);
            }
            Command::Flush { reply } => self.flush(reply).await,
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Applies a local edit and schedules a broadcasting save on success.
    fn edit<T>(
        &mut self,
        change: impl FnOnce(&mut Document, Millis) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let now = self.clock.now_ms();
        let result = change(&mut self.doc, now);
        if result.is_ok() {
            self.publish_document();
            self.schedule_save(true);
        }
        result
    }

    fn schedule_save(&mut self, broadcast: bool) {
        self.save_deadline = Some(Instant::now() + self.config.debounce);
        self.save_broadcasts |= broadcast;
    }

    async fn run_save(&mut self) {
        self.save_deadline = None;
        let broadcast = std::mem::take(&mut self.save_broadcasts);
        if let Err(e) = self.persist().await {
            tracing::debug!(error = %e, "save will be retried on the next change");
        }
        if broadcast {
            self.enqueue_broadcast(None);
        }
    }

    /// Prunes expired tombstones and writes the document.
    async fn persist(&mut self) -> Result<(), SyncError> {
        let now = self.clock.now_ms();
        let pruned = mutation::prune_tombstones(&mut self.doc, now, self.config.tombstone_retention);
        if pruned > 0 {
            tracing::debug!(pruned, "pruned expired tombstones");
            self.publish_document();
        }

        match store::save_document(&self.store, &self.doc).await {
            Ok(()) => {
                if self.persist_error.take().is_some() {
                    tracing::info!("local saves recovered");
                }
                self.refresh_status();
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to save document");
                let error = SyncError::from(e);
                self.persist_error = Some(error.to_string());
                self.refresh_status();
                Err(error)
            }
        }
    }

    fn enqueue_broadcast(&mut self, reply: Option<Reply<()>>) {
        let Some(session) = &self.session else {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        };
        let payload = match codec::encode_document(&self.doc) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode document for broadcast");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SyncError::Persist(e.to_string())));
                }
                return;
            }
        };
        if session.outbox.send(Outgoing { payload, reply }).is_err() {
            tracing::warn!("broadcaster is gone, dropping snapshot");
        }
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Broadcast { generation, result } => {
                let current = self.session.as_ref().map(|s| s.generation);
                if current != Some(generation) {
                    tracing::debug!(generation, "discarding broadcast result of an ended session");
                    return;
                }
                match result {
                    Ok(version) => {
                        tracing::debug!(%version, "broadcast stored");
                        self.republish_deadline = None;
                    }
                    Err(e) if e.is_hard() => {
                        tracing::warn!(error = %e, "broadcast rejected");
                        self.link = Some(LinkStatus::Error(e.to_string()));
                        self.refresh_status();
                    }
                    Err(e) => {
                        let retry_in = self.config.republish_delay;
                        tracing::warn!(error = %e, ?retry_in, "broadcast failed, will retry");
                        self.republish_deadline = Some(Instant::now() + retry_in);
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Remote { version, payload } => self.apply_remote(version, &payload).await,
            TransportEvent::Link(status) => {
                if status == LinkStatus::Connected && self.republish_deadline.is_some() {
                    // Let a snapshot delivered in the same poll merge first.
                    self.republish_deadline = Some(Instant::now() + self.config.debounce);
                }
                self.link = Some(status);
                self.refresh_status();
            }
        }
    }

    async fn apply_remote(&mut self, version: RemoteVersion, payload: &[u8]) {
        let remote = match codec::decode_document(payload) {
            Ok((doc, SchemaVersion::Current)) => doc,
            Ok((doc, SchemaVersion::Legacy)) => {
                tracing::info!(%version, "remote snapshot uses the legacy schema");
                doc
            }
            Err(e) => {
                tracing::warn!(%version, error = %e, "discarding undecodable remote snapshot");
                return;
            }
        };

        if let Some(session) = &mut self.session {
            session.received_remote = true;
        }
        if self.bootstrap_deadline.take().is_some() {
            tracing::debug!("remote snapshot arrived, bootstrap upload cancelled");
        }

        let merged = merge_documents(&self.doc, &remote);
        if merged == self.doc {
            tracing::debug!(%version, "remote snapshot already reflected locally");
            return;
        }
        self.doc = merged;
        self.publish_document();
        tracing::info!(%version, lists = self.doc.lists.len(), "merged remote snapshot");

        if let Err(e) = self.persist().await {
            tracing::debug!(error = %e, "merged document not saved");
        }
    }

    fn run_bootstrap(&mut self) {
        self.bootstrap_deadline = None;
        let Some(session) = &self.session else {
            return;
        };
        if session.received_remote {
            return;
        }
        if self.doc.is_empty() {
            tracing::debug!("no remote snapshot and nothing local, skipping bootstrap upload");
            return;
        }
        tracing::info!(
            account = %session.identity.account,
            lists = self.doc.lists.len(),
            "no remote snapshot arrived, uploading local document"
        );
        self.enqueue_broadcast(None);
    }

    async fn sign_in(&mut self, identity: Identity) -> Result<(), SyncError> {
        if let Some(session) = &self.session {
            if session.identity == identity {
                tracing::debug!(account = %identity.account, "already signed in");
                return Ok(());
            }
            tracing::info!(from = %session.identity, to = %identity, "switching account");
            self.sign_out().await;
        }

        let transport = Arc::new(self.factory.create(&identity)?);
        let (events_tx, events) = mpsc::channel(self.config.channel_capacity);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        self.generation += 1;
        tokio::spawn(run_broadcaster(
            Arc::clone(&transport),
            outbox_rx,
            self.generation,
            self.internal_tx.clone(),
        ));
        transport.start_listening(events_tx);
        tracing::info!(account = %identity.account, transport = %transport.kind(), "signed in");

        self.session = Some(Session {
            identity: identity.clone(),
            generation: self.generation,
            transport,
            events,
            outbox,
            received_remote: false,
        });
        self.link = None;
        self.bootstrap_deadline = Some(Instant::now() + self.config.bootstrap_delay);
        self.auth_tx.send_replace(AuthState::SignedIn(identity));
        self.refresh_status();
        Ok(())
    }

    /// Stops syncing and wipes every trace of the account locally.
    async fn sign_out(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.transport.stop();
        let account = session.identity.account.clone();
        drop(session);

        self.link = None;
        self.save_deadline = None;
        self.save_broadcasts = false;
        self.bootstrap_deadline = None;
        self.republish_deadline = None;
        self.doc = Document::default();
        self.publish_document();
        if let Err(e) = self.store.remove().await {
            tracing::warn!(error = %e, "failed to delete local snapshot");
        }
        self.persist_error = None;
        self.auth_tx.send_replace(AuthState::SignedOut);
        self.refresh_status();
        tracing::info!(account = %account, "signed out");
    }

    async fn manual_refresh(&mut self) {
        if self.save_deadline.take().is_some() {
            self.save_broadcasts = false;
            if let Err(e) = self.persist().await {
                tracing::debug!(error = %e, "save before manual refresh failed");
            }
        }
        if self.session.is_none() {
            tracing::debug!("manual refresh while signed out");
            return;
        }
        self.enqueue_broadcast(None);
        if let Some(session) = &self.session {
            session.transport.force_poll();
        }
    }

    async fn foreground_refresh(&mut self) -> Result<(), SyncError> {
        if self.save_deadline.is_some() {
            self.run_save().await;
        }
        if let Some(error) = &self.persist_error {
            tracing::warn!("local snapshot is stale, keeping in-memory document");
            return Err(SyncError::Persist(error.clone()));
        }

        match store::load_document(&self.store).await {
            Ok(Some((doc, _schema))) => {
                if doc != self.doc {
                    tracing::info!(lists = doc.lists.len(), "reloaded document from disk");
                    self.doc = doc;
                    self.publish_document();
                }
            }
            Ok(None) => tracing::debug!("no local snapshot to reload"),
            Err(e) => {
                tracing::warn!(error = %e, "foreground reload failed");
                return Err(e.into());
            }
        }
        if let Some(session) = &self.session {
            session.transport.force_poll();
        }
        Ok(())
    }

    async fn flush(&mut self, reply: Reply<()>) {
        self.save_deadline = None;
        self.save_broadcasts = false;
        if let Err(e) = self.persist().await {
            let _ = reply.send(Err(e));
            return;
        }
        self.enqueue_broadcast(Some(reply));
    }

    async fn shutdown(&mut self) {
        if self.save_deadline.is_some() {
            self.run_save().await;
        }
        if let Some(session) = self.session.take() {
            session.transport.stop();
        }
        tracing::info!("sync engine stopped");
    }

    fn publish_document(&self) {
        self.doc_tx.send_replace(Arc::new(self.doc.clone()));
    }

    fn refresh_status(&self) {
        let status = if let Some(error) = &self.persist_error {
            SyncStatus::Error(error.clone())
        } else {
            match (&self.session, &self.link) {
                (None, _) | (Some(_), None) => SyncStatus::Disconnected,
                (Some(_), Some(LinkStatus::Connected)) => SyncStatus::Connected,
                (Some(_), Some(LinkStatus::Error(msg))) => SyncStatus::Error(msg.clone()),
            }
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::info!(%status, "sync status changed");
            *current = status;
            true
        });
    }
}

async fn next_event<T>(session: &mut Option<Session<T>>) -> TransportEvent {
    if let Some(session) = session
        && let Some(event) = session.events.recv().await
    {
        return event;
    }
    std::future::pending().await
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Sends snapshots in order, skipping any superseded while waiting.
async fn run_broadcaster<T: Transport>(
    transport: Arc<T>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    generation: u64,
    results: mpsc::UnboundedSender<Internal>,
) {
    while let Some(first) = outbox.recv().await {
        let mut payload = first.payload;
        let mut waiters: Vec<Reply<()>> = first.reply.into_iter().collect();
        while let Ok(next) = outbox.try_recv() {
            payload = next.payload;
            waiters.extend(next.reply);
        }

        let result = transport.broadcast(payload).await;
        for waiter in waiters {
            let _ = waiter.send(result.clone().map(|_version| ()).map_err(SyncError::from));
        }
        if results.send(Internal::Broadcast { generation, result }).is_err() {
            break;
        }
    }
}

/// Cloneable handle to a running [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
    auth: watch::Receiver<AuthState>,
    document: watch::Receiver<Arc<Document>>,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Starts syncing as `identity`.
    ///
    /// Signing in as the current identity does nothing; signing in as a
    /// different one signs out first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] if no transport can be created.
    pub async fn sign_in(&self, identity: Identity) -> Result<(), SyncError> {
        self.request(|reply| Command::SignIn { identity, reply }).await
    }

    /// Stops syncing, wipes the local document and deletes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the engine has exited.
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::SignOut { reply }).await
    }

    /// Appends a new list.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the engine has exited.
    pub async fn create_list(&self, title: impl Into<String>) -> Result<ListId, SyncError> {
        let title = title.into();
        self.request(|reply| Command::CreateList { title, reply }).await
    }

    /// Deletes a list, tombstoning it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ListNotFound`] for an unknown list.
    pub async fn delete_list(&self, list_id: ListId) -> Result<(), SyncError> {
        self.request(|reply| Command::DeleteList { list_id, reply }).await
    }

    /// Appends a new item to a list.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ListNotFound`] for an unknown list.
    pub async fn create_item(
        &self,
        list_id: ListId,
        content: impl Into<String>,
    ) -> Result<ItemId, SyncError> {
        let content = content.into();
        self.request(|reply| Command::CreateItem {
            list_id,
            content,
            reply,
        })
        .await
    }

    /// Deletes an item, tombstoning it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ItemNotFound`] for an unknown item.
    pub async fn delete_item(&self, item_id: ItemId) -> Result<(), SyncError> {
        self.request(|reply| Command::DeleteItem { item_id, reply }).await
    }

    /// Applies a list mutation, or an item mutation to `item_id` in that list.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] for unknown ids or an item mutation without an
    /// item.
    pub async fn mutate(
        &self,
        list_id: ListId,
        item_id: Option<ItemId>,
        mutation: impl Into<Mutation>,
    ) -> Result<(), SyncError> {
        let mutation = mutation.into();
        self.request(|reply| Command::Mutate {
            list_id,
            item_id,
            mutation,
            reply,
        })
        .await
    }

    /// Applies an item mutation wherever the item lives.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ItemNotFound`] for an unknown item.
    pub async fn update_item(&self, item_id: ItemId, mutation: ItemMutation) -> Result<(), SyncError> {
        self.request(|reply| Command::UpdateItem {
            item_id,
            mutation,
            reply,
        })
        .await
    }

    /// Flips an item's completion flag.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ItemNotFound`] for an unknown item.
    pub async fn toggle_completion(&self, item_id: ItemId) -> Result<(), SyncError> {
        self.update_item(item_id, ItemMutation::ToggleCompleted).await
    }

    /// Replaces the merged "all tasks" order. Unknown ids are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the engine has exited.
    pub async fn set_merged_order(&self, order: Vec<ItemId>) -> Result<(), SyncError> {
        self.request(|reply| Command::SetMergedOrder { order, reply }).await
    }

    /// Stores the merged view's window geometry.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the engine has exited.
    pub async fn set_merged_geometry(&self, geometry: Geometry) -> Result<(), SyncError> {
        self.request(|reply| Command::SetMergedGeometry { geometry, reply })
            .await
    }

    /// "Sync now": saves any pending edit, broadcasts the current document
    /// and polls immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the engine has exited.
    pub async fn manual_refresh(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::ManualRefresh { reply }).await
    }

    /// Reloads the document from the local snapshot after the host
    /// returned to the foreground. Never broadcasts.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Persist`] if the snapshot cannot be read or local
    /// saves are failing.
    pub async fn foreground_refresh(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::ForegroundRefresh { reply })
            .await
    }

    /// Saves now and, when signed in, waits until the remote stored the
    /// document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Persist`] or [`SyncError::Transport`] if either
    /// step fails.
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Saves pending edits and stops the engine.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the engine already exited.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Current sync status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Current auth state.
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.auth.borrow().clone()
    }

    /// Receiver notified on every sign-in and sign-out.
    #[must_use]
    pub fn watch_auth(&self) -> watch::Receiver<AuthState> {
        self.auth.clone()
    }

    /// Current document snapshot.
    #[must_use]
    pub fn document(&self) -> Arc<Document> {
        Arc::clone(&self.document.borrow())
    }

    /// Receiver notified whenever the document changes.
    #[must_use]
    pub fn watch_document(&self) -> watch::Receiver<Arc<Document>> {
        self.document.clone()
    }
}
