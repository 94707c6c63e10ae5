/// Schema statements for the initial migration. Split out from
/// `migrations.rs` so later migrations can reference table names without
/// re-reading the full DDL.
pub const CREATE_META: &str = "
CREATE TABLE IF NOT EXISTS meta (
    version INTEGER NOT NULL
);
";

pub const CREATE_IMAGES: &str = "
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    md5 BLOB NOT NULL UNIQUE,
    rating INTEGER NOT NULL,
    source INTEGER NOT NULL,
    target_tag TEXT NOT NULL,
    blacklisted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS images_target_tag_idx ON images (target_tag, blacklisted, rating);
";

pub const CREATE_TAGS: &str = "
CREATE TABLE IF NOT EXISTS tags (
    image_id INTEGER NOT NULL REFERENCES images (id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (image_id, tag)
);
CREATE INDEX IF NOT EXISTS tags_tag_idx ON tags (tag);
";
