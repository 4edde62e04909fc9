//! In-memory view of one thread's messages plus the scroll arithmetic the
//! channel uses to decide when to back-fill and where to leave the viewer.

use std::collections::HashSet;

use shared::{
    domain::{ChatMessage, MessageId},
    protocol::MessagePage,
};

/// Scroll geometry of the message list, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Viewport {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl Viewport {
    pub fn new(scroll_top: f64, scroll_height: f64, client_height: f64) -> Self {
        Self {
            scroll_top,
            scroll_height,
            client_height,
        }
    }

    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    pub fn is_near_bottom(&self, threshold: f64) -> bool {
        self.distance_from_bottom() <= threshold
    }

    pub fn is_near_top(&self, threshold: f64) -> bool {
        self.scroll_top <= threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAction {
    StickToBottom,
    Preserve,
}

/// Keeps the focused message in place while older messages are prepended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub previous_scroll_height: f64,
    pub previous_scroll_top: f64,
}

impl ScrollAnchor {
    pub fn capture(viewport: &Viewport) -> Self {
        Self {
            previous_scroll_height: viewport.scroll_height,
            previous_scroll_top: viewport.scroll_top,
        }
    }

    /// Scroll offset to apply once the prepended rows are rendered.
    pub fn resolve(&self, new_scroll_height: f64) -> f64 {
        new_scroll_height - self.previous_scroll_height + self.previous_scroll_top
    }
}

/// A pushed message that made it into the window.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageArrival {
    pub message: ChatMessage,
    pub scroll: ScrollAction,
}

/// Claim on the next older page, handed out by
/// [`MessageWindow::begin_older_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OlderFetch {
    page: u32,
    serial: u64,
    generation: u64,
}

impl OlderFetch {
    pub fn page(&self) -> u32 {
        self.page
    }
}

/// Messages ordered by `created_at` ascending, unique by id.
#[derive(Debug, Default)]
pub struct MessageWindow {
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
    page: u32,
    has_more: bool,
    /// Bumped whenever the contents are replaced; older pages fetched for a
    /// previous generation are dropped.
    generation: u64,
    next_serial: u64,
    in_flight: Option<u64>,
}

impl MessageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    /// Number of history pages loaded so far.
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Drops every message. A fetch still running keeps the guard until it
    /// settles.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.page = 0;
        self.has_more = false;
        self.generation += 1;
    }

    /// Replaces the window with the newest page. Pushes that landed while
    /// the page was loading and are newer than it are kept.
    pub fn replace_with_initial(&mut self, page: MessagePage) {
        let previous = std::mem::take(&mut self.messages);
        self.ids.clear();
        self.generation += 1;
        self.page = 1;
        self.has_more = page.has_more;

        for message in page.messages.into_iter().rev() {
            if self.ids.insert(message.id) {
                self.messages.push(message);
            }
        }
        self.messages.sort_by_key(|m| m.created_at);

        let newest = self.messages.last().map(|m| m.created_at);
        for message in previous {
            let is_newer = newest.map_or(true, |newest| message.created_at > newest);
            if is_newer && self.ids.insert(message.id) {
                self.messages.push(message);
            }
        }
    }

    /// Claims the next older page, or `None` when there is nothing to load
    /// or a fetch is already running.
    pub fn begin_older_fetch(&mut self) -> Option<OlderFetch> {
        if self.page == 0 || !self.has_more || self.in_flight.is_some() {
            return None;
        }
        self.next_serial += 1;
        self.in_flight = Some(self.next_serial);
        Some(OlderFetch {
            page: self.page + 1,
            serial: self.next_serial,
            generation: self.generation,
        })
    }

    fn settle(&mut self, fetch: &OlderFetch) -> bool {
        if self.in_flight == Some(fetch.serial) {
            self.in_flight = None;
        }
        fetch.generation == self.generation
    }

    pub fn abort_older_fetch(&mut self, fetch: OlderFetch) {
        self.settle(&fetch);
    }

    /// Prepends an older page and returns the messages that were new, or
    /// `None` when the window was replaced while the page was loading.
    pub fn finish_older_fetch(
        &mut self,
        fetch: OlderFetch,
        page: MessagePage,
    ) -> Option<Vec<ChatMessage>> {
        if !self.settle(&fetch) {
            return None;
        }
        self.page = self.page.max(fetch.page);
        self.has_more = page.has_more;

        let mut added = Vec::with_capacity(page.messages.len());
        for message in page.messages.into_iter().rev() {
            if self.ids.insert(message.id) {
                added.push(message);
            }
        }
        if added.is_empty() {
            return Some(added);
        }

        let mut merged = added.clone();
        merged.append(&mut self.messages);
        merged.sort_by_key(|m| m.created_at);
        self.messages = merged;
        Some(added)
    }

    /// Appends a pushed message; `false` when its id is already present.
    pub fn push_live(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let in_order = self
            .messages
            .last()
            .map_or(true, |last| last.created_at <= message.created_at);
        if in_order {
            self.messages.push(message);
        } else {
            let index = self
                .messages
                .partition_point(|m| m.created_at <= message.created_at);
            self.messages.insert(index, message);
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/message_window_tests.rs"]
mod tests;
