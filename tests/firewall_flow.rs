//! 端到端测试：防火墙完整请求流程
//!
//! 测试场景：
//! 1. 正常请求全部放行
//! 2. 超过阈值触发自动封禁并发出事件
//! 3. 手动解封后恢复访问
//! 4. 白名单压过黑名单和自动封禁
//! 5. 运行时规则覆盖立即生效

use async_trait::async_trait;
use ipguard::prelude::*;
use ipguard::state::unix_now;
use serde_json::json;
use std::sync::Arc;

/// 记录事件的测试接收器
#[derive(Debug, Default)]
struct RecordingSink {
    events: parking_lot::Mutex<Vec<BlockEvent>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, event: &BlockEvent) {
        self.events.lock().push(event.clone());
    }
}

fn setup(
    mutate: impl FnOnce(&mut FirewallConfig),
) -> (Firewall, Arc<MemoryStateStore>, Arc<RecordingSink>) {
    let mut config = FirewallConfig::default();
    mutate(&mut config);
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(RecordingSink::default());
    let firewall = Firewall::new(config, store.clone(), Some(sink.clone())).unwrap();
    (firewall, store, sink)
}

/// 端到端测试：超限封禁到手动解封的完整流程
#[tokio::test]
async fn test_e2e_flood_block_unblock() {
    let (firewall, _, sink) = setup(|c| c.rules.requests_per_minute.limit = 10);
    let ip = "198.51.100.77";
    let ctx = RequestContext::new(ip).with_uri("/api/data").with_method("GET");

    // Step 1: 阈值以内全部放行
    for i in 0..10 {
        let decision = firewall.handle_request(&ctx).await;
        assert_eq!(decision, Decision::Allowed, "request {} should be allowed", i);
    }

    // Step 2: 第11个请求触发封禁
    let decision = firewall.handle_request(&ctx).await;
    assert_eq!(
        decision,
        Decision::Blocked {
            status: 403,
            reason: "requests_per_minute".to_string(),
        }
    );

    let events = sink.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ip, ip);
    assert_eq!(events[0].reason, "requests_per_minute");
    assert_eq!(events[0].source, BlockSource::Auto);
    assert_eq!(events[0].description, "11/10 per minute");

    // Step 3: 封禁期间持续被拒绝，且不再重复发事件
    for _ in 0..3 {
        assert!(firewall.handle_request(&ctx).await.is_blocked());
    }
    assert_eq!(sink.events.lock().len(), 1);

    // Step 4: 操作员查看并解封
    let blocked = firewall.registry().list_blocked().await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].ip, ip);

    assert!(firewall.registry().unblock(ip).await.unwrap());
    assert!(!firewall.registry().is_blocked(ip).await.unwrap());
    assert!(firewall.registry().list_blocked().await.unwrap().is_empty());

    // Step 5: 解封同时清掉了计数窗口，恢复正常访问
    assert_eq!(firewall.handle_request(&ctx).await, Decision::Allowed);
}

/// 端到端测试：白名单压过黑名单和自动封禁
#[tokio::test]
async fn test_e2e_allow_list_precedence() {
    let (firewall, store, _) = setup(|c| {
        c.allow_list = vec!["192.0.2.0/24".to_string()];
        c.deny_list = vec!["192.0.2.66".to_string()];
        c.rules.requests_per_minute.limit = 1;
    });
    let ip = "192.0.2.66";

    // 注入一条未过期的自动封禁
    let now = unix_now();
    let mut state = store.load().await.unwrap();
    state.blocked.insert(
        ip.to_string(),
        BlockEntry {
            ip: ip.to_string(),
            reason: "requests_per_minute".to_string(),
            source: BlockSource::Auto,
            description: "seeded".to_string(),
            blocked_at: now,
            expires_at: now + 3600,
        },
    );
    store.save(&state, false).await.unwrap();

    // 黑名单和封禁记录都命中，白名单仍然放行
    assert!(!firewall.registry().is_blocked(ip).await.unwrap());
    let ctx = RequestContext::new(ip);
    for _ in 0..5 {
        assert_eq!(firewall.handle_request(&ctx).await, Decision::Allowed);
    }
}

/// 端到端测试：运行时规则覆盖立即生效
#[tokio::test]
async fn test_e2e_runtime_rule_override() {
    let (firewall, _, _) = setup(|_| {});
    let ctx = RequestContext::new("198.51.100.88");

    // 默认阈值100，两个请求远未超限
    assert_eq!(firewall.handle_request(&ctx).await, Decision::Allowed);
    assert_eq!(firewall.handle_request(&ctx).await, Decision::Allowed);

    // 运行时把阈值压到2
    let patch = json!({"requests_per_minute": {"limit": 2}});
    firewall
        .registry()
        .update_rules(patch.as_object().unwrap())
        .await
        .unwrap();

    // 第3个请求超过新阈值
    assert!(firewall.handle_request(&ctx).await.is_blocked());

    // 清理封禁后用null删除覆盖，恢复默认阈值
    firewall.registry().unblock("198.51.100.88").await.unwrap();
    let patch = json!({"requests_per_minute": null});
    firewall
        .registry()
        .update_rules(patch.as_object().unwrap())
        .await
        .unwrap();
    assert_eq!(firewall.handle_request(&ctx).await, Decision::Allowed);
}

/// 端到端测试：可疑载荷封禁与排除路径
#[tokio::test]
async fn test_e2e_payload_block_and_exclusion() {
    let (firewall, _, sink) = setup(|c| {
        c.rules.suspicious_payload.patterns =
            vec!["union select".to_string(), "<script".to_string()];
        c.payload_exclusions = vec!["/webhooks/".to_string()];
    });

    // 排除路径上的可疑载荷放行
    let excluded = RequestContext::new("198.51.100.99")
        .with_uri("/webhooks/github")
        .with_body("payload=<script>alert(1)</script>");
    assert_eq!(firewall.handle_request(&excluded).await, Decision::Allowed);

    // 普通路径上命中第二个模式
    let attacked = RequestContext::new("198.51.100.99")
        .with_uri("/comments")
        .with_body_param("text", "<SCRIPT>document.cookie</SCRIPT>");
    let decision = firewall.handle_request(&attacked).await;
    assert_eq!(
        decision,
        Decision::Blocked {
            status: 403,
            reason: "suspicious_payload".to_string(),
        }
    );
    assert!(sink.events.lock()[0].description.contains("<script"));
}

/// 端到端测试：404扫描触发封禁
#[tokio::test]
async fn test_e2e_not_found_scanner() {
    let (firewall, _, sink) = setup(|c| c.rules.not_found_per_minute.limit = 3);
    let ip = "198.51.100.44";

    // 扫描器逐个探测不存在的路径
    for i in 0..3 {
        let ctx = RequestContext::new(ip).with_uri(&format!("/wp-admin/{}", i));
        assert_eq!(firewall.handle_request(&ctx).await, Decision::Allowed);
        assert_eq!(firewall.handle_response(&ctx, 404).await, Decision::Allowed);
    }

    let ctx = RequestContext::new(ip).with_uri("/wp-admin/final");
    firewall.handle_request(&ctx).await;
    let decision = firewall.handle_response(&ctx, 404).await;
    assert!(decision.is_blocked());
    assert_eq!(sink.events.lock()[0].reason, "not_found_per_minute");

    // 封禁生效后入站请求直接被拒
    assert!(firewall.handle_request(&ctx).await.is_blocked());
}

/// 端到端测试：暴力尝试401触发封禁
#[tokio::test]
async fn test_e2e_unauthorized_brute_force() {
    let (firewall, _, sink) = setup(|c| c.rules.unauthorized_per_minute.limit = 5);
    let ip = "198.51.100.55";
    let ctx = RequestContext::new(ip).with_uri("/login").with_method("POST");

    for _ in 0..5 {
        assert_eq!(firewall.handle_response(&ctx, 401).await, Decision::Allowed);
    }
    assert!(firewall.handle_response(&ctx, 401).await.is_blocked());
    assert_eq!(sink.events.lock()[0].reason, "unauthorized_per_minute");
    assert_eq!(sink.events.lock()[0].description, "6/5 per minute");
}
