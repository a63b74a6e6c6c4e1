//! Shared fixtures: an in-memory RRDP publication server.

#![allow(dead_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rrdp_core::{ContentHash, MemoryFetchClient};
use std::collections::BTreeMap;

pub const NOTIFICATION_URL: &str = "https://rrdp.example.net/notification.xml";

const NS: &str = "http://www.ripe.net/rpki/rrdp";

/// A publication point whose documents can be installed into a
/// [`MemoryFetchClient`].
///
/// Changes are staged with [`publish`](Self::publish) and
/// [`withdraw`](Self::withdraw) and become one delta on
/// [`commit`](Self::commit).
#[derive(Clone)]
pub struct Publication {
    pub session: String,
    pub serial: u64,
    objects: BTreeMap<String, Vec<u8>>,
    deltas: BTreeMap<u64, String>,
    pending: Vec<String>,
}

impl Publication {
    pub fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
            serial: 1,
            objects: BTreeMap::new(),
            deltas: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    /// A publication at `serial` with a handful of objects, every serial
    /// reachable by delta.
    pub fn at_serial(session: &str, serial: u64) -> Self {
        let mut publication = Self::new(session);
        while publication.serial < serial {
            let n = publication.serial;
            publication.publish(&format!("rsync://repo.example.net/ca/{}.roa", n % 4), format!("roa-{}", n).as_bytes());
            publication.commit();
        }
        publication
    }

    pub fn publish(&mut self, uri: &str, content: &[u8]) {
        let encoded = STANDARD.encode(content);
        let element = match self.objects.get(uri) {
            Some(old) => format!(
                r#"<publish uri="{}" hash="{}">{}</publish>"#,
                uri,
                ContentHash::of(old),
                encoded
            ),
            None => format!(r#"<publish uri="{}">{}</publish>"#, uri, encoded),
        };
        self.pending.push(element);
        self.objects.insert(uri.to_string(), content.to_vec());
    }

    pub fn withdraw(&mut self, uri: &str) {
        if let Some(old) = self.objects.remove(uri) {
            self.pending.push(format!(
                r#"<withdraw uri="{}" hash="{}"/>"#,
                uri,
                ContentHash::of(&old)
            ));
        }
    }

    /// Turn the staged changes into the delta for the next serial.
    pub fn commit(&mut self) -> u64 {
        self.serial += 1;
        let body: String = self.pending.drain(..).collect();
        let xml = format!(
            r#"<delta xmlns="{}" version="1" session_id="{}" serial="{}">{}</delta>"#,
            NS, self.session, self.serial, body
        );
        self.deltas.insert(self.serial, xml);
        self.serial
    }

    /// Stop advertising the delta for `serial`.
    pub fn forget_delta(&mut self, serial: u64) {
        self.deltas.remove(&serial);
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.objects.contains_key(uri)
    }

    pub fn snapshot_url(&self) -> String {
        format!("https://rrdp.example.net/{}/{}/snapshot.xml", self.session, self.serial)
    }

    pub fn delta_url(&self, serial: u64) -> String {
        format!("https://rrdp.example.net/{}/{}/delta.xml", self.session, serial)
    }

    pub fn snapshot_xml(&self) -> String {
        let mut xml = format!(
            r#"<snapshot xmlns="{}" version="1" session_id="{}" serial="{}">"#,
            NS, self.session, self.serial
        );
        for (uri, content) in &self.objects {
            // Wrapped like real servers do.
            xml.push_str(&format!(
                "<publish uri=\"{}\">\n  {}\n</publish>\n",
                uri,
                STANDARD.encode(content)
            ));
        }
        xml.push_str("</snapshot>");
        xml
    }

    pub fn delta_xml(&self, serial: u64) -> Option<&str> {
        self.deltas.get(&serial).map(String::as_str)
    }

    pub fn notification_xml(&self) -> String {
        let mut xml = format!(
            r#"<notification xmlns="{}" version="1" session_id="{}" serial="{}">"#,
            NS, self.session, self.serial
        );
        xml.push_str(&format!(
            r#"<snapshot uri="{}" hash="{}"/>"#,
            self.snapshot_url(),
            ContentHash::of(self.snapshot_xml().as_bytes())
        ));
        // Newest first, as most servers list them.
        for (serial, body) in self.deltas.iter().rev() {
            xml.push_str(&format!(
                r#"<delta serial="{}" uri="{}" hash="{}"/>"#,
                serial,
                self.delta_url(*serial),
                ContentHash::of(body.as_bytes())
            ));
        }
        xml.push_str("</notification>");
        xml
    }

    /// Serve the current notification, snapshot and all deltas.
    pub fn install(&self, fetcher: &MemoryFetchClient) {
        self.install_at(fetcher, NOTIFICATION_URL);
    }

    pub fn install_at(&self, fetcher: &MemoryFetchClient, notification_url: &str) {
        fetcher.insert(notification_url, self.notification_xml());
        fetcher.insert(self.snapshot_url(), self.snapshot_xml());
        for (serial, body) in &self.deltas {
            fetcher.insert(self.delta_url(*serial), body.clone());
        }
    }

    /// Like [`install_at`](Self::install_at), with the notification served
    /// under a `Last-Modified` time.
    pub fn install_modified_at(
        &self,
        fetcher: &MemoryFetchClient,
        notification_url: &str,
        last_modified: DateTime<Utc>,
    ) {
        self.install_at(fetcher, notification_url);
        fetcher.insert_with_last_modified(notification_url, self.notification_xml(), last_modified);
    }

    /// Digests a client should hold after synchronizing.
    pub fn digests(&self) -> BTreeMap<String, ContentHash> {
        self.objects
            .iter()
            .map(|(uri, content)| (uri.clone(), ContentHash::of(content)))
            .collect()
    }
}
