//! Index schema: relational mirror of the archive plus FTS5 search.

pub const PRAGMA_SQL: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
";

pub const CREATE_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    human_key TEXT NOT NULL,
    created_ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_projects_slug ON projects(slug);

CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    name TEXT NOT NULL COLLATE NOCASE,
    program TEXT NOT NULL,
    model TEXT NOT NULL,
    task_description TEXT NOT NULL DEFAULT '',
    inception_ts TEXT NOT NULL,
    last_active_ts TEXT NOT NULL,
    contact_policy TEXT NOT NULL DEFAULT 'auto',
    UNIQUE(project_id, name)
);
CREATE INDEX IF NOT EXISTS idx_agents_project_name ON agents(project_id, name);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    thread_id TEXT NOT NULL,
    subject TEXT NOT NULL,
    body_md TEXT NOT NULL,
    from_agent TEXT NOT NULL COLLATE NOCASE,
    created_ts TEXT NOT NULL,
    importance TEXT NOT NULL DEFAULT 'normal',
    ack_required INTEGER NOT NULL DEFAULT 0,
    kind TEXT NOT NULL DEFAULT 'normal',
    overseer INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_project_created ON messages(project_id, created_ts);
CREATE INDEX IF NOT EXISTS idx_messages_project_thread ON messages(project_id, thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_project_sender ON messages(project_id, from_agent, created_ts);

CREATE TABLE IF NOT EXISTS message_recipients (
    message_id TEXT NOT NULL REFERENCES messages(id),
    agent_name TEXT NOT NULL COLLATE NOCASE,
    kind TEXT NOT NULL DEFAULT 'to',
    read_ts TEXT,
    ack_ts TEXT,
    PRIMARY KEY (message_id, agent_name, kind)
);
CREATE INDEX IF NOT EXISTS idx_recipients_agent ON message_recipients(agent_name, message_id);

CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    agent_name TEXT NOT NULL COLLATE NOCASE,
    path TEXT NOT NULL,
    exclusive INTEGER NOT NULL DEFAULT 1,
    reason TEXT NOT NULL DEFAULT '',
    created_ts TEXT NOT NULL,
    expires_ts TEXT NOT NULL,
    released_ts TEXT
);
CREATE INDEX IF NOT EXISTS idx_claims_project_active ON claims(project_id, released_ts, expires_ts);
CREATE INDEX IF NOT EXISTS idx_claims_project_agent ON claims(project_id, agent_name, released_ts);

CREATE TABLE IF NOT EXISTS agent_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_project_id INTEGER NOT NULL REFERENCES projects(id),
    from_agent TEXT NOT NULL COLLATE NOCASE,
    to_project_id INTEGER NOT NULL REFERENCES projects(id),
    to_agent TEXT NOT NULL COLLATE NOCASE,
    state TEXT NOT NULL DEFAULT 'pending',
    created_ts TEXT NOT NULL,
    decided_ts TEXT,
    UNIQUE(from_project_id, from_agent, to_project_id, to_agent)
);

CREATE TABLE IF NOT EXISTS contact_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    from_agent TEXT NOT NULL COLLATE NOCASE,
    to_agent TEXT NOT NULL COLLATE NOCASE,
    reason TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT 'pending',
    created_ts TEXT NOT NULL,
    decided_ts TEXT,
    UNIQUE(project_id, from_agent, to_agent)
);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_messages USING fts5(
    message_id UNINDEXED,
    subject,
    body
);
";

pub const CREATE_FTS_TRIGGERS_SQL: &str = "
CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO fts_messages(message_id, subject, body)
    VALUES (NEW.id, NEW.subject, NEW.body_md);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    DELETE FROM fts_messages WHERE message_id = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    DELETE FROM fts_messages WHERE message_id = OLD.id;
    INSERT INTO fts_messages(message_id, subject, body)
    VALUES (NEW.id, NEW.subject, NEW.body_md);
END;
";

/// Tables cleared by `rebuild-index`, children first so foreign keys hold.
pub const WIPE_SQL: &str = "
DELETE FROM message_recipients;
DELETE FROM fts_messages;
DELETE FROM messages;
DELETE FROM claims;
DELETE FROM contact_requests;
DELETE FROM agent_links;
DELETE FROM agents;
DELETE FROM projects;
";
