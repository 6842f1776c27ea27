// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 示例应用
//!
//! 一组基于路由层的用户增删改查接口，外加回显请求信息的 `/any` 与逐段输出的 `/stream`。

use std::time::Duration;

use log::debug;
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::json;

use crate::{exception::Exception, response::Response, route::HandlerResult, server::Server};

/// `/stream` 输出的段数
pub const STREAM_CHUNKS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde_derive::Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub name: String,
    pub age: i64,
}

/// 请求体无法解码时的统一响应
fn invalid_body() -> serde_json::Value {
    json!({ "error": "Invalid request body" })
}

/// 以指定状态码写出 JSON
async fn reply<T>(res: &mut Response, status: u16, value: &T) -> HandlerResult
where
    T: Serialize + ?Sized,
{
    res.status(status).json(value).await?;
    Ok(())
}

/// 在 `server` 上注册全部示例路由
pub fn routes(server: &Server, stream_delay: Duration) -> Result<(), Exception> {
    server.get("/users/{id}", |req, res| {
        Box::pin(async move {
            let user = User {
                id: req.path_param("id").to_string(),
                name: "Nishad".to_string(),
                age: 22,
            };
            reply(res, 200, &user).await
        })
    })?;

    server.post("/users", |req, res| {
        Box::pin(async move {
            match req.body::<User>() {
                Ok(user) => reply(res, 201, &user).await,
                Err(e) => {
                    debug!("创建用户失败: {}", e);
                    reply(res, 400, &invalid_body()).await
                }
            }
        })
    })?;

    server.put("/users/{id}", |req, res| {
        Box::pin(async move {
            let mut user = match req.body::<User>() {
                Ok(user) => user,
                Err(e) => {
                    debug!("更新用户失败: {}", e);
                    return reply(res, 400, &invalid_body()).await;
                }
            };
            user.id = req.path_param("id").to_string();
            reply(res, 200, &user).await
        })
    })?;

    server.delete("/users/{id}", |req, res| {
        Box::pin(async move {
            let message = format!("User {} deleted", req.path_param("id"));
            reply(res, 200, &json!({ "message": message })).await
        })
    })?;

    server.any("/any", |req, res| {
        Box::pin(async move {
            let echo = json!({
                "method": req.method().as_str(),
                "queries": req.query(),
                "headers": req.headers(),
            });
            reply(res, 200, &echo).await
        })
    })?;

    server.get("/stream", move |_req, res| {
        Box::pin(async move {
            res.header("Content-Type", "text/plain");
            for i in 0..STREAM_CHUNKS {
                if i > 0 {
                    tokio::time::sleep(stream_delay).await;
                }
                res.write(format!("Chunk {}\n", i).as_bytes()).await?;
            }
            res.end().await?;
            Ok(())
        })
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_defaults() {
        let user: User = serde_json::from_str(r#"{"name":"Ann"}"#).unwrap();
        assert_eq!(
            user,
            User {
                id: String::new(),
                name: "Ann".to_string(),
                age: 0
            }
        );
        assert!(serde_json::from_str::<User>(r#"{"age":"old"}"#).is_err());
    }

    #[test]
    fn test_user_wire_format() {
        let user = User {
            id: "7".to_string(),
            name: "Nishad".to_string(),
            age: 22,
        };
        assert_eq!(
            serde_json::to_string(&user).unwrap(),
            r#"{"id":"7","name":"Nishad","age":22}"#
        );
    }

    #[test]
    fn test_routes_registered() {
        let server = Server::new();
        routes(&server, Duration::from_millis(0)).unwrap();
        assert_eq!(server.route_count(), 6);
    }
}
