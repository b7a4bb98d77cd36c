//! Declarative catalog of Graph endpoints exposed as tools.

use reqwest::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Patch,
    Delete,
}

impl Verb {
    pub fn method(self) -> Method {
        match self {
            Self::Get => Method::GET,
            Self::Post => Method::POST,
            Self::Patch => Method::PATCH,
            Self::Delete => Method::DELETE,
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, Self::Get)
    }
}

/// A query parameter a tool accepts and forwards to Graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryParam {
    /// Tool argument name.
    pub arg: &'static str,
    /// Graph query key.
    pub key: &'static str,
    pub description: &'static str,
    pub required: bool,
}

const fn odata(arg: &'static str, key: &'static str, description: &'static str) -> QueryParam {
    QueryParam {
        arg,
        key,
        description,
        required: false,
    }
}

pub const TOP: QueryParam = odata("top", "$top", "Maximum number of items per page");
pub const SKIP: QueryParam = odata("skip", "$skip", "Number of items to skip");
pub const FILTER: QueryParam = odata("filter", "$filter", "OData filter expression");
pub const SELECT: QueryParam = odata("select", "$select", "Comma-separated properties to return");
pub const ORDER_BY: QueryParam = odata("orderby", "$orderby", "Sort expression, e.g. 'receivedDateTime desc'");
pub const SEARCH: QueryParam = odata("search", "$search", "Free-text search, quoted");
pub const EXPAND: QueryParam = odata("expand", "$expand", "Related entities to include");
pub const COUNT: QueryParam = odata("count", "$count", "Include @odata.count ('true')");

const LIST: &[QueryParam] = &[TOP, SKIP, FILTER, SELECT, ORDER_BY, EXPAND, COUNT];
const LIST_SEARCHABLE: &[QueryParam] = &[TOP, SKIP, FILTER, SELECT, ORDER_BY, SEARCH, EXPAND, COUNT];
const ITEM: &[QueryParam] = &[SELECT, EXPAND];

const CALENDAR_VIEW: &[QueryParam] = &[
    QueryParam {
        arg: "startDateTime",
        key: "startDateTime",
        description: "Window start, ISO 8601",
        required: true,
    },
    QueryParam {
        arg: "endDateTime",
        key: "endDateTime",
        description: "Window end, ISO 8601",
        required: true,
    },
    TOP,
    SELECT,
    ORDER_BY,
    FILTER,
];

/// One Graph endpoint. Path parameters are written `{name}` in `path`.
#[derive(Debug, Clone, Copy)]
pub struct GraphEndpoint {
    pub name: &'static str,
    pub description: &'static str,
    pub verb: Verb,
    pub path: &'static str,
    pub scopes: &'static [&'static str],
    pub query: &'static [QueryParam],
    /// Description of the JSON body, for endpoints that take one.
    pub body: Option<&'static str>,
    /// Collection endpoints return `value` arrays and may page.
    pub collection: bool,
}

impl GraphEndpoint {
    pub fn path_params(&self) -> impl Iterator<Item = &'static str> {
        let path: &'static str = self.path;
        path.split('/')
            .filter_map(|segment| segment.strip_prefix('{')?.strip_suffix('}'))
    }

    pub fn is_write(&self) -> bool {
        self.verb.is_write()
    }
}

const fn read(
    name: &'static str,
    description: &'static str,
    path: &'static str,
    scopes: &'static [&'static str],
    query: &'static [QueryParam],
    collection: bool,
) -> GraphEndpoint {
    GraphEndpoint {
        name,
        description,
        verb: Verb::Get,
        path,
        scopes,
        query,
        body: None,
        collection,
    }
}

const fn write(
    name: &'static str,
    description: &'static str,
    verb: Verb,
    path: &'static str,
    scopes: &'static [&'static str],
    body: Option<&'static str>,
) -> GraphEndpoint {
    GraphEndpoint {
        name,
        description,
        verb,
        path,
        scopes,
        query: &[],
        body,
        collection: false,
    }
}

const USER_READ: &[&str] = &["User.Read"];
const MAIL_READ: &[&str] = &["Mail.Read"];
const MAIL_SEND: &[&str] = &["Mail.Send"];
const MAIL_WRITE: &[&str] = &["Mail.ReadWrite"];
const CALENDARS_READ: &[&str] = &["Calendars.Read"];
const CALENDARS_WRITE: &[&str] = &["Calendars.ReadWrite"];
const FILES_READ: &[&str] = &["Files.Read"];
const TASKS_READ: &[&str] = &["Tasks.Read"];
const TASKS_WRITE: &[&str] = &["Tasks.ReadWrite"];
const CONTACTS_READ: &[&str] = &["Contacts.Read"];
const CONTACTS_WRITE: &[&str] = &["Contacts.ReadWrite"];

pub const ENDPOINTS: &[GraphEndpoint] = &[
    read("get-current-user", "Get the signed-in user's profile", "/me", USER_READ, ITEM, false),
    // Mail
    read("list-mail-messages", "List messages in the signed-in user's mailbox", "/me/messages", MAIL_READ, LIST_SEARCHABLE, true),
    read("list-mail-folders", "List the user's mail folders", "/me/mailFolders", MAIL_READ, LIST, true),
    read("list-mail-folder-messages", "List messages in one mail folder", "/me/mailFolders/{mailFolderId}/messages", MAIL_READ, LIST_SEARCHABLE, true),
    read("get-mail-message", "Get one message", "/me/messages/{messageId}", MAIL_READ, ITEM, false),
    write("send-mail", "Send a message as the signed-in user", Verb::Post, "/me/sendMail", MAIL_SEND,
        Some("sendMail payload: { message: { subject, body, toRecipients }, saveToSentItems }")),
    write("delete-mail-message", "Delete a message", Verb::Delete, "/me/messages/{messageId}", MAIL_WRITE, None),
    // Calendar
    read("list-calendars", "List the user's calendars", "/me/calendars", CALENDARS_READ, LIST, true),
    read("list-calendar-events", "List events in the user's default calendar", "/me/events", CALENDARS_READ, LIST, true),
    read("get-calendar-event", "Get one calendar event", "/me/events/{eventId}", CALENDARS_READ, ITEM, false),
    read("get-calendar-view", "List event occurrences inside a time window", "/me/calendarView", CALENDARS_READ, CALENDAR_VIEW, true),
    write("create-calendar-event", "Create an event in the default calendar", Verb::Post, "/me/events", CALENDARS_WRITE,
        Some("event resource: { subject, start, end, attendees, body }")),
    write("update-calendar-event", "Update an event", Verb::Patch, "/me/events/{eventId}", CALENDARS_WRITE,
        Some("properties of the event to change")),
    write("delete-calendar-event", "Delete an event", Verb::Delete, "/me/events/{eventId}", CALENDARS_WRITE, None),
    // OneDrive
    read("list-drives", "List the user's drives", "/me/drives", FILES_READ, LIST, true),
    read("get-drive-root-item", "Get the root folder of a drive", "/drives/{driveId}/root", FILES_READ, ITEM, false),
    read("list-folder-files", "List children of a drive folder", "/drives/{driveId}/items/{driveItemId}/children", FILES_READ, LIST, true),
    // To Do
    read("list-todo-task-lists", "List Microsoft To Do task lists", "/me/todo/lists", TASKS_READ, LIST, true),
    read("list-todo-tasks", "List tasks in a To Do list", "/me/todo/lists/{todoTaskListId}/tasks", TASKS_READ, LIST, true),
    write("create-todo-task", "Create a task in a To Do list", Verb::Post, "/me/todo/lists/{todoTaskListId}/tasks", TASKS_WRITE,
        Some("todoTask resource: { title, dueDateTime, importance }")),
    write("update-todo-task", "Update a To Do task", Verb::Patch, "/me/todo/lists/{todoTaskListId}/tasks/{todoTaskId}", TASKS_WRITE,
        Some("properties of the task to change")),
    write("delete-todo-task", "Delete a To Do task", Verb::Delete, "/me/todo/lists/{todoTaskListId}/tasks/{todoTaskId}", TASKS_WRITE, None),
    // Contacts
    read("list-outlook-contacts", "List the user's Outlook contacts", "/me/contacts", CONTACTS_READ, LIST_SEARCHABLE, true),
    read("get-outlook-contact", "Get one Outlook contact", "/me/contacts/{contactId}", CONTACTS_READ, ITEM, false),
    write("create-outlook-contact", "Create an Outlook contact", Verb::Post, "/me/contacts", CONTACTS_WRITE,
        Some("contact resource: { givenName, surname, emailAddresses }")),
];

pub fn find(name: &str) -> Option<&'static GraphEndpoint> {
    ENDPOINTS.iter().find(|endpoint| endpoint.name == name)
}
