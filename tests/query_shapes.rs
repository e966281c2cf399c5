//! SQL shapes the query sets compile to, end to end: plain selects,
//! nested relation fetches, branch-visibility CTEs, artifact resolution
//! and many-to-many traversal. These run against the process-wide
//! registry the way user model code would.

use std::sync::Once;

use pretty_assertions::assert_eq;
use turntable::versioning::context;
use turntable::{
    FieldDecl, LogicalType, Model, ModelDeclaration, Record, Registry, RelationDecl, SqlValue,
};

struct User {
    id: Option<i32>,
    name: String,
    age: i64,
}

impl Model for User {
    const MODEL_NAME: &'static str = "User";

    fn declaration() -> ModelDeclaration {
        ModelDeclaration::new("User", "users")
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("name", LogicalType::Text))
            .field(FieldDecl::new("age", LogicalType::Integer))
            .relation(RelationDecl::one_to_many("posts", "Post", "posts", "user_id"))
            .relation(RelationDecl::many_to_many(
                "comments",
                "Comment",
                "comments",
                "user_comment_rel",
                ("user_id", "comment_id"),
            ))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id.map(i64::from))
            .with("name", self.name.clone())
            .with("age", self.age)
    }

    fn from_record(record: Record) -> turntable::Result<Self> {
        Ok(Self {
            id: record.opt_i64("id")?.map(|id| id as i32),
            name: record.text("name")?,
            age: record.i64("age")?,
        })
    }
}

struct Post {
    id: Option<i32>,
    title: String,
    user_id: Option<i64>,
}

impl Model for Post {
    const MODEL_NAME: &'static str = "Post";

    fn declaration() -> ModelDeclaration {
        ModelDeclaration::new("Post", "posts")
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("title", LogicalType::Text))
            .field(FieldDecl::new("user_id", LogicalType::Integer).foreign_key("users"))
            .relation(RelationDecl::one_to_many(
                "comments", "Comment", "comments", "post_id",
            ))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id.map(i64::from))
            .with("title", self.title.clone())
            .with("user_id", self.user_id)
    }

    fn from_record(record: Record) -> turntable::Result<Self> {
        Ok(Self {
            id: record.opt_i64("id")?.map(|id| id as i32),
            title: record.text("title")?,
            user_id: record.opt_i64("user_id")?,
        })
    }
}

struct Comment {
    id: Option<i32>,
    content: String,
    post_id: Option<i64>,
}

impl Model for Comment {
    const MODEL_NAME: &'static str = "Comment";

    fn declaration() -> ModelDeclaration {
        ModelDeclaration::new("Comment", "comments")
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("content", LogicalType::Text))
            .field(
                FieldDecl::new("post_id", LogicalType::Integer)
                    .foreign_key("posts")
                    .optional(),
            )
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id.map(i64::from))
            .with("content", self.content.clone())
            .with("post_id", self.post_id)
    }

    fn from_record(record: Record) -> turntable::Result<Self> {
        Ok(Self {
            id: record.opt_i64("id")?.map(|id| id as i32),
            content: record.text("content")?,
            post_id: record.opt_i64("post_id")?,
        })
    }
}

struct UserCommentRel {
    id: Option<i32>,
    user_id: i64,
    comment_id: i64,
}

impl Model for UserCommentRel {
    const MODEL_NAME: &'static str = "UserCommentRel";

    fn declaration() -> ModelDeclaration {
        ModelDeclaration::new("UserCommentRel", "user_comment_rel")
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("user_id", LogicalType::Integer).foreign_key("users"))
            .field(FieldDecl::new("comment_id", LogicalType::Integer).foreign_key("comments"))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id.map(i64::from))
            .with("user_id", self.user_id)
            .with("comment_id", self.comment_id)
    }

    fn from_record(record: Record) -> turntable::Result<Self> {
        Ok(Self {
            id: record.opt_i64("id")?.map(|id| id as i32),
            user_id: record.i64("user_id")?,
            comment_id: record.i64("comment_id")?,
        })
    }
}

struct Message {
    id: Option<i32>,
    content: String,
    turn_id: Option<i64>,
    branch_id: Option<i64>,
}

impl Model for Message {
    const MODEL_NAME: &'static str = "Message";

    fn declaration() -> ModelDeclaration {
        ModelDeclaration::new("Message", "messages")
            .versioned()
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("content", LogicalType::Text))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id.map(i64::from))
            .with("content", self.content.clone())
            .with("turn_id", self.turn_id)
            .with("branch_id", self.branch_id)
    }

    fn from_record(record: Record) -> turntable::Result<Self> {
        Ok(Self {
            id: record.opt_i64("id")?.map(|id| id as i32),
            content: record.text("content")?,
            turn_id: record.opt_i64("turn_id")?,
            branch_id: record.opt_i64("branch_id")?,
        })
    }
}

struct Note {
    id: Option<i32>,
    content: String,
    artifact_id: Option<uuid::Uuid>,
    version: Option<i64>,
}

impl Model for Note {
    const MODEL_NAME: &'static str = "Note";

    fn declaration() -> ModelDeclaration {
        ModelDeclaration::new("Note", "notes")
            .artifact()
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("content", LogicalType::Text))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id.map(i64::from))
            .with("content", self.content.clone())
            .with("artifact_id", self.artifact_id)
            .with("version", self.version)
    }

    fn from_record(record: Record) -> turntable::Result<Self> {
        Ok(Self {
            id: record.opt_i64("id")?.map(|id| id as i32),
            content: record.text("content")?,
            artifact_id: record.opt_uuid("artifact_id")?,
            version: record.opt_i64("version")?,
        })
    }
}

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let registry = Registry::global();
        registry.register::<User>().unwrap();
        registry.register::<Post>().unwrap();
        registry.register::<Comment>().unwrap();
        registry.register::<UserCommentRel>().unwrap();
        registry.register::<Message>().unwrap();
        registry.register::<Note>().unwrap();
        registry.validate().unwrap();
    });
}

#[test]
fn simple_select_with_predicate() {
    setup();
    let compiled = User::query()
        .unwrap()
        .select(&["*"])
        .filter(|u| u.col("age").gt(21i64))
        .compile()
        .unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT u.id, u.name, u.age FROM users AS u WHERE (u.age > $1)"
    );
    assert_eq!(compiled.params, vec![SqlValue::Int(21)]);
}

#[test]
fn predicates_compose_with_bit_ops() {
    setup();
    let compiled = User::query()
        .unwrap()
        .filter(|u| u.col("age").gte(18i64) & (u.col("name").eq("Alice") | u.col("name").is_null()))
        .compile()
        .unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT u.id, u.name, u.age FROM users AS u \
         WHERE ((u.age >= $1) AND ((u.name = $2) OR (u.name IS NULL)))"
    );
    assert_eq!(compiled.params.len(), 2);
}

#[test]
fn nested_relation_fetch_aggregates_children() {
    setup();
    let compiled = User::query()
        .unwrap()
        .join(Post::query().unwrap())
        .unwrap()
        .compile()
        .unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT u.id, u.name, u.age, \
         COALESCE(json_agg(DISTINCT jsonb_build_object('id', p.id, 'title', p.title, 'user_id', p.user_id)) \
         FILTER (WHERE (NOT (p.id IS NULL))), '[]') AS posts \
         FROM users AS u \
         LEFT JOIN posts AS p ON (u.id = p.user_id) \
         GROUP BY u.id"
    );
    assert!(compiled.params.is_empty());
}

#[test]
fn depth_two_join_emits_correlated_subquery() {
    setup();
    let compiled = User::query()
        .unwrap()
        .join(Post::query().unwrap().join(Comment::query().unwrap()).unwrap())
        .unwrap()
        .compile()
        .unwrap();

    // The grandchild aggregation is independent of sibling cardinality:
    // it lives in a correlated subquery, not a flat join.
    assert!(compiled.sql.contains(
        "'comments', COALESCE((SELECT json_agg(jsonb_build_object('id', c.id, 'content', c.content, 'post_id', c.post_id)) \
         FROM comments AS c WHERE (c.post_id = p.id)), '[]')"
    ));
    assert!(!compiled.sql.contains("JOIN comments"));
    assert!(compiled.sql.ends_with("GROUP BY u.id"));
}

#[test]
fn versioned_query_resolves_branch_visibility() {
    setup();
    let compiled = Message::query_at(2).unwrap().compile().unwrap();

    assert_eq!(
        compiled.sql,
        "WITH turn_hierarchy AS (\
             WITH RECURSIVE branch_hierarchy AS (\
                 SELECT id, forked_from_index, forked_from_branch_id, current_index AS start_turn_index \
                 FROM branches WHERE id = 2 \
                 UNION ALL \
                 SELECT b.id, b.forked_from_index, b.forked_from_branch_id, bh.forked_from_index AS start_turn_index \
                 FROM branches b \
                 JOIN branch_hierarchy bh ON b.id = bh.forked_from_branch_id\
             ) \
             SELECT t.id FROM turns AS t \
             INNER JOIN branch_hierarchy AS bh ON (t.branch_id = bh.id) \
             WHERE ((t.status = $1) AND (t.index <= bh.start_turn_index)) \
             ORDER BY t.index DESC\
         ) \
         SELECT m.id, m.content, m.created_at, m.updated_at, m.turn_id, m.branch_id \
         FROM messages AS m \
         INNER JOIN turn_hierarchy AS th ON (m.turn_id = th.id)"
    );
    assert_eq!(compiled.params, vec![SqlValue::Text("committed".into())]);
}

#[tokio::test]
async fn versioned_query_follows_ambient_branch() {
    setup();
    let compiled = context::Context::new()
        .with_branch(7)
        .scope(async { Message::query().unwrap().compile().unwrap() })
        .await;
    assert!(compiled.sql.contains("FROM branches WHERE id = 7"));

    // No ambient context: the root branch.
    let compiled = Message::query().unwrap().compile().unwrap();
    assert!(compiled.sql.contains("FROM branches WHERE id = 1"));
}

#[test]
fn turn_pinned_query_caps_the_seed_index() {
    setup();
    let compiled = Message::query_at_turn(1, 2).unwrap().compile().unwrap();
    assert!(compiled
        .sql
        .contains("SELECT id, forked_from_index, forked_from_branch_id, 2 AS start_turn_index"));
    assert!(compiled.sql.contains("FROM branches WHERE id = 1"));
}

#[test]
fn artifact_query_takes_latest_live_version() {
    setup();
    let compiled = Note::query_at(1).unwrap().compile().unwrap();

    assert!(compiled.sql.contains("DISTINCT ON (n.artifact_id)"));
    assert!(compiled
        .sql
        .contains("ORDER BY n.artifact_id DESC, n.version DESC"));
    assert!(compiled.sql.ends_with("WHERE (n.deleted_at IS NULL)"));
    // Visibility still applies underneath the version resolution.
    assert!(compiled.sql.contains("WITH RECURSIVE branch_hierarchy"));
}

#[test]
fn many_to_many_traversal_goes_through_junction() {
    setup();
    let user = User {
        id: Some(1),
        name: "Alice".into(),
        age: 30,
    };
    let compiled = user.related::<Comment>().unwrap().compile().unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT c.id, c.content, c.post_id FROM comments AS c \
         WHERE (c.id IN (SELECT comment_id FROM user_comment_rel WHERE (user_id = $1)))"
    );
    assert_eq!(compiled.params, vec![SqlValue::Int(1)]);
}

#[test]
fn related_query_requires_saved_parent() {
    setup();
    let unsaved = User {
        id: None,
        name: "Ghost".into(),
        age: 1,
    };
    assert!(unsaved.related::<Comment>().is_err());
}

#[test]
fn first_and_last_pin_primary_key_order() {
    setup();
    let compiled = User::query().unwrap().first().unwrap().compile().unwrap();
    assert!(compiled.sql.ends_with("ORDER BY u.id ASC LIMIT 1"));

    let compiled = User::query().unwrap().last().unwrap().compile().unwrap();
    assert!(compiled.sql.ends_with("ORDER BY u.id DESC LIMIT 1"));
}

#[test]
fn placeholder_count_matches_params_across_shapes() {
    setup();
    let sets = vec![
        User::query()
            .unwrap()
            .filter(|u| u.col("age").between(20i64, 30i64))
            .where_eq("name", "Bo")
            .compile()
            .unwrap(),
        Message::query_at(3).unwrap().compile().unwrap(),
        User::query()
            .unwrap()
            .filter(|u| u.col("age").in_list([1i64, 2, 3]))
            .compile()
            .unwrap(),
    ];
    for compiled in sets {
        let max_placeholder = (1..)
            .take_while(|n| compiled.sql.contains(&format!("${n}")))
            .count();
        assert_eq!(max_placeholder, compiled.params.len(), "{}", compiled.sql);
    }
}

#[test]
fn nested_children_decode_back_into_models() {
    setup();
    let mut record = Record::new();
    record.set("id", 1i64);
    record.set(
        "posts",
        serde_json::json!([
            {"id": 10, "title": "P1", "user_id": 1},
            {"id": 11, "title": "P2", "user_id": 1},
        ]),
    );

    let posts: Vec<Post> = turntable::decode_children(&mut record, "posts").unwrap();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].title, "P1");
    assert_eq!(posts[1].id, Some(11));

    // A parent fetched without the join decodes to no children.
    let mut bare = Record::new();
    let none: Vec<Post> = turntable::decode_children(&mut bare, "posts").unwrap();
    assert!(none.is_empty());
}

#[test]
fn join_without_declared_relation_fails() {
    setup();
    let err = Comment::query()
        .unwrap()
        .join(User::query().unwrap())
        .unwrap_err();
    assert!(matches!(err, turntable::Error::Schema(_)));
}

#[test]
fn limit_offset_and_order_render_in_slot_order() {
    setup();
    let compiled = Post::query()
        .unwrap()
        .order_by(&["-title"])
        .limit(10)
        .offset(5)
        .compile()
        .unwrap();
    assert!(compiled
        .sql
        .ends_with("ORDER BY p.title DESC LIMIT 10 OFFSET 5"));
}
