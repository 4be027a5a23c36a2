use serde_json::{json, Value};

/// Tool definitions advertised by `tools/list`.
pub fn list_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "search",
            "description": "Search the Apple developer documentation corpus and \
                return ranked, formatted passages with source URLs.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural-language search query",
                    },
                    "result_count": {
                        "type": "integer",
                        "description": "Number of results to return (1-10, default 4)",
                        "minimum": 1,
                        "maximum": 10,
                    },
                },
                "required": ["query"],
            },
        }),
        json!({
            "name": "fetch",
            "description": "Fetch the full content of a documentation page by URL.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "URL of the document to fetch",
                    },
                },
                "required": ["url"],
            },
        }),
    ]
}
