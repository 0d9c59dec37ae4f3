//! Bootstrap page that connects a browser to a sandbox's noVNC endpoint.

use serde_json::Value;

const RFB_MODULE: &str = "https://cdn.jsdelivr.net/gh/novnc/noVNC@master/core/rfb.js";
const WEBSOCKIFY_PATH: &str = "websockify";

/// Where the page's RFB client connects.
#[derive(Debug, Clone)]
pub struct ViewerTarget<'a> {
    pub session_id: &'a str,
    pub host: &'a str,
    pub display_port: u16,
    pub password: &'a str,
}

/// JavaScript string literal for `value`.
fn js_string(value: &str) -> String {
    // JSON strings are valid JS literals; `<` is escaped so the value cannot
    // close the surrounding script element.
    Value::String(value.to_string())
        .to_string()
        .replace('<', "\\u003c")
}

fn html_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render(target: &ViewerTarget<'_>) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>NoVNC Session {title}</title>
    <style>
        html {{ height: 100%; }}
        body {{
            margin: 0;
            background-color: dimgrey;
            height: 100%;
            display: flex;
            flex-direction: column;
        }}
        #top_bar {{
            background-color: #6e84a3;
            color: white;
            font: bold 12px Helvetica;
            padding: 6px 5px 4px 5px;
            border-bottom: 1px outset;
        }}
        #status {{ text-align: center; }}
        #sendCtrlAltDelButton {{
            position: fixed;
            top: 0px;
            right: 0px;
            border: 1px outset;
            padding: 5px;
            cursor: pointer;
        }}
        #screen {{ flex: 1; overflow: hidden; }}
    </style>
    <script type="module">
        import RFB from '{module}';

        const host = {host};
        const port = {port};
        const password = {password};
        const path = {path};

        function status(text) {{
            document.getElementById('status').textContent = text;
        }}

        const scheme = window.location.protocol === "https:" ? "wss://" : "ws://";
        const url = scheme + host + ":" + port + "/" + path;

        let rfb;
        document.addEventListener("DOMContentLoaded", () => {{
            document.getElementById('sendCtrlAltDelButton').onclick = () => {{
                if (rfb) {{
                    rfb.sendCtrlAltDel();
                }}
            }};
            status("Connecting");
            try {{
                rfb = new RFB(document.getElementById('screen'), url, {{
                    credentials: {{ password: password }}
                }});
                rfb.addEventListener("connect", () => status("Connected to VNC"));
                rfb.addEventListener("disconnect", () => status("Disconnected"));
                rfb.viewOnly = false;
                rfb.scaleViewport = true;
            }} catch (err) {{
                console.error("VNC Connection Error:", err);
                status("Error: " + err);
            }}
        }});
    </script>
</head>
<body>
    <div id="top_bar">
        <div id="status">Loading</div>
        <div id="sendCtrlAltDelButton">Send CtrlAltDel</div>
    </div>
    <div id="screen"></div>
</body>
</html>
"#,
        title = html_text(target.session_id),
        module = RFB_MODULE,
        host = js_string(target.host),
        port = js_string(&target.display_port.to_string()),
        password = js_string(target.password),
        path = js_string(WEBSOCKIFY_PATH),
    )
}
