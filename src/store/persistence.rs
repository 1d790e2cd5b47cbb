//! Sled-backed persistence for task, story, page, collection and image records.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

use crate::error::StorageError;
use crate::story::{Page, StoryRecord};
use crate::store::{PageStore, TaskRecord, TaskRecordStore};
use crate::types::{CollectionId, ImageRef, StoryId, TaskId};
use crate::visual::CollectionVisualContext;

const TREE_TASKS: &str = "tasks";
const TREE_STORIES: &str = "stories";
const TREE_PAGES: &str = "pages";
const TREE_COLLECTIONS: &str = "collections";
const TREE_IMAGES: &str = "images";
const PAGE_KEY_PAD: usize = 6;

/// One sled database with a tree per record kind. Values are JSON.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    tasks: Tree,
    stories: Tree,
    pages: Tree,
    collections: Tree,
    images: Tree,
}

impl SledStore {
    /// Open (or create) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(to_storage_io)?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        let tasks = db.open_tree(TREE_TASKS).map_err(to_storage_io)?;
        let stories = db.open_tree(TREE_STORIES).map_err(to_storage_io)?;
        let pages = db.open_tree(TREE_PAGES).map_err(to_storage_io)?;
        let collections = db.open_tree(TREE_COLLECTIONS).map_err(to_storage_io)?;
        let images = db.open_tree(TREE_IMAGES).map_err(to_storage_io)?;
        Ok(Self {
            db,
            tasks,
            stories,
            pages,
            collections,
            images,
        })
    }

    pub fn shared<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::open(path)?))
    }

    /// Get the underlying sled database (for advanced operations)
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn encode_page_key(story_id: &StoryId, page_number: u32) -> String {
        encode_page_key(story_id, page_number)
    }

    /// Write raw bytes under a task key. Lets tests simulate a corrupt record.
    pub fn put_raw_task(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.tasks.insert(key.as_bytes(), value).map_err(to_storage_io)?;
        Ok(())
    }
}

impl TaskRecordStore for SledStore {
    fn put_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        put_json(&self.tasks, record.id.as_str(), record)
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StorageError> {
        get_json(&self.tasks, id.as_str())
    }

    fn remove_task(&self, id: &TaskId) -> Result<(), StorageError> {
        self.tasks.remove(id.as_str().as_bytes()).map_err(to_storage_io)?;
        Ok(())
    }

    fn list_tasks(&self) -> Result<(Vec<TaskRecord>, Vec<String>), StorageError> {
        let mut records = Vec::new();
        let mut unreadable = Vec::new();
        for item in self.tasks.iter() {
            let (key, value) = item.map_err(to_storage_io)?;
            match serde_json::from_slice::<TaskRecord>(&value) {
                Ok(record) => records.push(record),
                Err(_) => unreadable.push(String::from_utf8_lossy(&key).into_owned()),
            }
        }
        records.sort_by_key(|r| r.created_at_ms);
        Ok((records, unreadable))
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }
}

impl PageStore for SledStore {
    fn put_story(&self, story: &StoryRecord) -> Result<(), StorageError> {
        put_json(&self.stories, story.id.as_str(), story)
    }

    fn get_story(&self, id: &StoryId) -> Result<Option<StoryRecord>, StorageError> {
        get_json(&self.stories, id.as_str())
    }

    fn list_stories(&self) -> Result<Vec<StoryRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.stories.iter() {
            let (key, value) = item.map_err(to_storage_io)?;
            out.push(decode(&key, &value)?);
        }
        Ok(out)
    }

    fn put_page(&self, page: &Page) -> Result<(), StorageError> {
        put_json(
            &self.pages,
            &encode_page_key(&page.story_id, page.page_number),
            page,
        )
    }

    fn get_page(&self, story_id: &StoryId, page_number: u32) -> Result<Option<Page>, StorageError> {
        get_json(&self.pages, &encode_page_key(story_id, page_number))
    }

    fn list_pages(&self, story_id: &StoryId) -> Result<Vec<Page>, StorageError> {
        let prefix = format!("{story_id}:");
        let mut out: Vec<Page> = Vec::new();
        for item in self.pages.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(to_storage_io)?;
            let page: Page = decode(&key, &value)?;
            // Ids may contain ':', so "a:" also prefixes the pages of story "a:b".
            if page.story_id == *story_id {
                out.push(page);
            }
        }
        out.sort_by_key(|p| p.page_number);
        Ok(out)
    }

    fn put_collection(&self, context: &CollectionVisualContext) -> Result<(), StorageError> {
        put_json(&self.collections, context.collection_id.as_str(), context)
    }

    fn get_collection(
        &self,
        id: &CollectionId,
    ) -> Result<Option<CollectionVisualContext>, StorageError> {
        get_json(&self.collections, id.as_str())
    }

    fn put_image(&self, bytes: &[u8]) -> Result<ImageRef, StorageError> {
        let image = ImageRef::for_bytes(bytes);
        self.images
            .insert(image.as_str().as_bytes(), bytes)
            .map_err(to_storage_io)?;
        Ok(image)
    }

    fn get_image(&self, image: &ImageRef) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .images
            .get(image.as_str().as_bytes())
            .map_err(to_storage_io)?
            .map(|bytes| bytes.to_vec()))
    }
}

fn put_json<T: Serialize>(tree: &Tree, key: &str, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value).map_err(to_storage_data)?;
    tree.insert(key.as_bytes(), bytes).map_err(to_storage_io)?;
    Ok(())
}

fn get_json<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>, StorageError> {
    let Some(raw) = tree.get(key.as_bytes()).map_err(to_storage_io)? else {
        return Ok(None);
    };
    Ok(Some(decode(key.as_bytes(), &raw)?))
}

fn decode<T: DeserializeOwned>(key: &[u8], value: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(value).map_err(|e| StorageError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

fn encode_page_key(story_id: &StoryId, page_number: u32) -> String {
    format!("{story_id}:{page_number:0PAGE_KEY_PAD$}")
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}
