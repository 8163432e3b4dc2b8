//! Index lifecycle and document upsert helpers shared by the
//! pipeline and the search path.

use std::fs;
use std::path::Path;

use tantivy::schema::*;
use tantivy::{Index, IndexWriter, TantivyDocument, Term, doc};

use crate::entity::Entity;
use crate::vault::Note;

pub fn open_or_create(dir: &Path, schema: Schema) -> tantivy::Result<Index> {
    fs::create_dir_all(dir).ok();
    let mmap_dir = tantivy::directory::MmapDirectory::open(dir)?;
    Index::open_or_create(mmap_dir, schema)
}

/// Resets an index by deleting all data and recreating it empty.
/// Used for rebuilds and schema migrations since there is no way to
/// migrate a tantivy index in place.
pub fn recreate_index(dir: &Path, schema: Schema) -> tantivy::Result<Index> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    open_or_create(dir, schema)
}

// Deletes and then writes the document to get upsert behavior.
pub fn upsert_note_doc(
    index_writer: &mut IndexWriter,
    schema: &Schema,
    note: &Note,
    body: &str,
) -> tantivy::Result<()> {
    let path = schema.get_field("path")?;
    let title = schema.get_field("title")?;
    let tags = schema.get_field("tags")?;
    let body_field = schema.get_field("body")?;

    index_writer.delete_term(Term::from_field_text(path, &note.path));

    let mut document: TantivyDocument = doc!(
        path => note.path.as_str(),
        title => note.title.as_str(),
        body_field => body,
    );
    if !note.tags.is_empty() {
        let tag_list = note.tags.iter().cloned().collect::<Vec<_>>().join(",");
        document.add_text(tags, tag_list);
    }
    index_writer.add_document(document)?;
    Ok(())
}

pub fn delete_note_doc(
    index_writer: &mut IndexWriter,
    schema: &Schema,
    note_path: &str,
) -> tantivy::Result<()> {
    let path = schema.get_field("path")?;
    index_writer.delete_term(Term::from_field_text(path, note_path));
    Ok(())
}

pub fn upsert_entity_doc(
    index_writer: &mut IndexWriter,
    schema: &Schema,
    entity: &Entity,
) -> tantivy::Result<()> {
    let name = schema.get_field("name")?;
    let search_text = schema.get_field("search_text")?;
    let category = schema.get_field("category")?;
    let path = schema.get_field("path")?;

    index_writer.delete_term(Term::from_field_text(name, &entity.name));

    let searchable = if entity.aliases.is_empty() {
        entity.name.clone()
    } else {
        format!("{} {}", entity.name, entity.aliases.join(" "))
    };
    index_writer.add_document(doc!(
        name => entity.name.as_str(),
        search_text => searchable,
        category => entity.category.as_str(),
        path => entity.path.as_str(),
    ))?;
    Ok(())
}

pub fn delete_entity_doc(
    index_writer: &mut IndexWriter,
    schema: &Schema,
    entity_name: &str,
) -> tantivy::Result<()> {
    let name = schema.get_field("name")?;
    index_writer.delete_term(Term::from_field_text(name, entity_name));
    Ok(())
}
