use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::SystemTime,
};

use crate::{adapters, model};

/// In-memory bucket with marker and delimiter semantics of a real listing.
#[derive(Default)]
pub struct MockClient {
    pub objects: Mutex<BTreeMap<String, (Vec<u8>, SystemTime)>>,
    pub calls: AtomicUsize,
    pub fail_list: AtomicBool,
}

impl MockClient {
    pub fn with_objects(objects: &[(&str, usize)]) -> Self {
        let client = MockClient::default();
        for (key, size) in objects {
            client.put(key, vec![b'x'; *size]);
        }
        client
    }

    pub fn put(&self, key: &str, body: Vec<u8>) {
        let modified_time = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body, modified_time));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn entries(&self, prefix: &str, delimiter: &str) -> Vec<model::fs::FSObject> {
        let objects = self.objects.lock().unwrap();
        let mut entries: Vec<model::fs::FSObject> = Vec::new();

        for (key, (body, modified_time)) in objects.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            let rest = &key[prefix.len()..];
            match rest.find(delimiter).filter(|_| !delimiter.is_empty()) {
                Some(pos) => {
                    let common = format!("{}{}", prefix, &rest[..pos + delimiter.len()]);
                    if entries.last().map(|e| e.key == common).unwrap_or(false) {
                        continue;
                    }
                    entries.push(model::fs::FSObject::dir(&common));
                }
                None => entries.push(model::fs::FSObject::file(
                    key,
                    body.len() as u64,
                    *modified_time,
                )),
            }
        }

        entries
    }
}

impl adapters::ObjectAdapter for MockClient {
    fn fs_list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        page_size: usize,
        page_token: &str,
    ) -> Result<model::fs::ListPage, model::fs::FSError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(model::fs::FSError::remote(format!(
                "failed to list_objects at: {}, injected",
                prefix
            )));
        }

        let entries = self.entries(prefix, delimiter);
        let start = entries.partition_point(|e| e.key.as_str() <= page_token);
        let end = (start + page_size).min(entries.len());
        let objects = entries[start..end].to_vec();
        let next_page_token = objects.last().map(|o| o.key.clone()).unwrap_or_default();

        Ok(model::fs::ListPage {
            objects,
            next_page_token,
            is_last_page: end == entries.len(),
        })
    }

    fn fs_head_object(
        &self,
        key: &str,
    ) -> Result<Option<model::fs::FSObject>, model::fs::FSError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(key)
            .map(|(body, modified_time)| {
                model::fs::FSObject::file(key, body.len() as u64, *modified_time)
            }))
    }

    fn fs_download_object(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Option<Vec<u8>>, model::fs::FSError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let body = match objects.get(key) {
            None => return Ok(None),
            Some((body, _)) => body,
        };

        Ok(Some(match range {
            None => body.clone(),
            Some((start, end)) => {
                let start = (start as usize).min(body.len());
                let end = (end as usize + 1).min(body.len());
                body[start..end].to_vec()
            }
        }))
    }
}
