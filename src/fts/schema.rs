//! Tantivy schemas for the two full-text corpora: note bodies and
//! entity names. Both run the Porter-stemming `en_stem` pipeline so
//! "deploying" finds "deploy".

use tantivy::schema::*;

fn stemmed_text() -> TextOptions {
    TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored()
}

pub fn note_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    // Raw key field so upserts can delete by exact path.
    schema_builder.add_text_field("path", STRING | STORED);
    schema_builder.add_text_field("title", stemmed_text());
    schema_builder.add_text_field("tags", TEXT | STORED);
    schema_builder.add_text_field("body", stemmed_text());
    schema_builder.build()
}

pub fn entity_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("name", STRING | STORED);
    // Name plus aliases, stemmed, the actual search surface.
    schema_builder.add_text_field("search_text", stemmed_text());
    schema_builder.add_text_field("category", STRING | STORED);
    schema_builder.add_text_field("path", STRING | STORED);
    schema_builder.build()
}
